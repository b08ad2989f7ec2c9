use anyhow::{Context, Result};
use manga_parser::config::Config;
use std::path::{Path, PathBuf};

/// Load and validate a configuration file, then print the effective settings
pub async fn check_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;

    println!("Configuration OK: {}", path.display());
    println!("  Output directory: {}", config.storage.base_path.display());
    println!("  Temp directory: {}", config.storage.temp_path.display());
    println!("  Max concurrent tasks: {}", config.orchestrator.max_concurrent_tasks);
    println!("  Command timeout: {}s", config.orchestrator.command_timeout_secs);
    println!(
        "  Proxy pool: {} ({} inline{})",
        if config.proxy.enabled { "enabled" } else { "disabled" },
        config.proxy.servers.len(),
        config
            .proxy
            .file
            .as_ref()
            .map(|f| format!(", file {}", f.display()))
            .unwrap_or_default()
    );
    println!(
        "  HTTP API: {}",
        if config.http.enabled {
            config.http.listen_addr.as_str()
        } else {
            "disabled"
        }
    );
    println!("  Catalog service: {}", config.services.manga_service_url);
    Ok(())
}

/// Write a configuration file populated with every default
pub async fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let content = toml::to_string_pretty(&Config::default()).context("Failed to render default config")?;
    std::fs::write(&path, format!("# Manga parser configuration\n\n{}", content))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created configuration file: {}", path.display());
    Ok(())
}
