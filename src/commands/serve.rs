use anyhow::Result;
use manga_parser::{config::Config, daemon::Daemon};

/// Run the HTTP daemon in the foreground
pub async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let mut config = config;
    if let Some(addr) = listen {
        config.http.enabled = true;
        config.http.listen_addr = addr;
        config.validate()?;
    }

    let daemon = Daemon::start(config).await?;
    daemon.run().await
}
