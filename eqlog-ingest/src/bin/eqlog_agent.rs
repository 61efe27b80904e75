//! Equipment log agent: tails equipment files and upserts their records into the store.

use anyhow::{Context, Result};
use eqlog_ingest::config::AgentConfig;
use eqlog_ingest::runner;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = AgentConfig::path_from_env();
    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    runner::file_mode::run(&config).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
