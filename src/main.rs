// Harvester service binary.
//
// Boots the component graph, starts the sidecar, mirrors bus events into the
// log, and runs until ctrl-c. The desktop shell's RPC transport is hosted
// elsewhere; this binary demonstrates the wiring and lifecycle.

use anyhow::Result;
use tracing::{error, info, warn};

use weibo_harvester::{AppContext, HarvesterConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = HarvesterConfig::from_env()?;
    let _log_guard = weibo_harvester::logging::init(&config)?;

    info!(
        namespace = %config.namespace,
        redis = %config.redis_url,
        "harvester starting"
    );

    let context = AppContext::initialize(config)?;

    if let Err(e) = context.start_playwright_server().await {
        warn!(error = %e, "sidecar did not start; login and crawling unavailable until it does");
    }

    // Mirror bus traffic into the structured log until a front end attaches.
    let mut events = context.bus().subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(topic = event.topic(), payload = ?event, "event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    if let Err(e) = context.shutdown().await {
        error!(error = %e, "shutdown error");
    }
    event_logger.abort();

    info!("harvester stopped");
    Ok(())
}
