use anyhow::Context;

use sandcastle_infra::config::SandcastleConfig;
use sandcastle_worker::app::{self, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SandcastleConfig::from_env().context("invalid configuration")?;
    sandcastle_observability::init(config.log_format);

    let services = Services::from_config(&config).await?;
    let running = app::start(&config, services).await?;
    tracing::info!(worker_ids = ?running.worker_ids(), "waiting for jobs");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    running.shutdown().await;
    Ok(())
}
