use anyhow::Result;
use clap::Parser;
use shipwatch::{telemetry, AppConfig, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::try_from(Cli::parse())?;
    telemetry::init_tracing(&config.log_filter);
    tracing::info!(
        channel = %config.channel.name,
        snapshot = %config.snapshot_url,
        debounce_ms = config.sync.debounce.as_millis() as u64,
        "starting shipwatch"
    );
    shipwatch::run(config).await
}
