use tracing::info;

use multiverse_bridge::AgentLauncher;
use multiverse_core::telemetry::init_tracing;
use multiverse_core::{MultiverseConfig, RetryPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing("info,multiverse_core=info,multiverse_bridge=info");

    let config = MultiverseConfig::load()?;
    info!(
        url = %config.broker.url,
        namespace = config.scheme.namespace(),
        agents = config.agents.len(),
        "Starting agent listeners"
    );

    let launcher = AgentLauncher::start(&config, RetryPolicy::default()).await?;
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down agents...");

    let stats = launcher.shutdown().await?;
    for (agent, s) in &stats {
        info!(agent = %agent, received = s.received, handled = s.handled, failed = s.failed, "Final stats");
    }
    Ok(())
}
