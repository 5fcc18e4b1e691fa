mod server;

use anyhow::{Context, Result};
use tracing::info;

use relayhub_cluster::{ConnectionLimits, Hub};
use relayhub_core::{bootstrap::load_config, logging};

use server::RelayHubServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("relayhub starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Connect the hub (fails fast when the broker is unreachable)
    let hub = Hub::from_config(&config)
        .await
        .with_context(|| format!("Failed to connect hub to {}", redacted(config.redis_url())))?;
    info!(pod_id = %hub.instance_id(), channel = %hub.config().channel, "Hub connected");

    // 4. Start background work before accepting connections
    hub.start();

    // 5. Serve until a signal arrives or the hub gives up on the broker
    let limits = ConnectionLimits::from(&config.connection);
    RelayHubServer::new(config, hub, limits).run().await
}

/// Strip credentials from a broker URL before it is logged
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}
