//! Manga parser service
//!
//! Background scraping tasks over a REST API, plus one-shot CLI commands.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use manga_parser::config::{Config, LogFormat, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

#[derive(Parser)]
#[command(name = "manga-parser")]
#[command(about = "Manga scraping and build task orchestrator")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API daemon
    Serve {
        /// Override the HTTP listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Parse titles once and print the resulting task
    Parse {
        /// Title slugs
        #[arg(required = true)]
        slugs: Vec<String>,

        /// Source parser name
        #[arg(short, long)]
        parser: Option<String>,

        /// Import results into the catalog afterwards
        #[arg(long)]
        auto_import: bool,
    },

    /// Validate the configuration file
    CheckConfig,

    /// Write a configuration file with every default
    Init {
        /// Output path
        #[arg(default_value = "config.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Init { path } => return commands::init_config(path).await,
        Commands::CheckConfig => return commands::check_config(&cli.config).await,
        command => command,
    };

    let config = Config::load_or_default(&cli.config)?;
    let _guard = init_logging(&config.logging, &config.storage.logs_path, cli.verbose)?;

    match command {
        Commands::Serve { listen } => commands::serve(config, listen).await,
        Commands::Parse {
            slugs,
            parser,
            auto_import,
        } => commands::run_parse(config, slugs, parser, auto_import).await,
        Commands::CheckConfig | Commands::Init { .. } => Ok(()),
    }
}

/// Install the global subscriber. The returned guard flushes the file sink on drop.
fn init_logging(config: &LoggingConfig, logs_path: &Path, verbose: u8) -> Result<Option<WorkerGuard>> {
    let level = config.level.more_verbose(verbose);
    let filter = if verbose > 0 {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Text => fmt::layer().with_target(false).boxed(),
    });

    let mut guard = None;
    if config.file {
        std::fs::create_dir_all(logs_path)
            .with_context(|| format!("Failed to create log directory {}", logs_path.display()))?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(config.file_prefix.as_str())
            .build(logs_path)
            .context("Failed to create rolling log file")?;
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(match config.format {
            LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
            LogFormat::Text => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
        });
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
