//! Server lifecycle management
//!
//! Runs the HTTP/WebSocket listener next to the hub and tears both down on
//! a shutdown signal, or when the hub stops on its own after repeated broker
//! failures.

use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use relayhub_api::{create_router, AppState};
use relayhub_cluster::{ConnectionLimits, Hub, HubState};
use relayhub_core::Config;

pub struct RelayHubServer {
    config: Config,
    hub: Hub,
    limits: ConnectionLimits,
}

impl RelayHubServer {
    pub const fn new(config: Config, hub: Hub, limits: ConnectionLimits) -> Self {
        Self { config, hub, limits }
    }

    /// Serve until shutdown, then stop the hub
    pub async fn run(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(AppState::new(self.hub.clone(), self.limits.clone()));

        let hub = self.hub.clone();
        let graceful = async move {
            tokio::select! {
                () = shutdown_signal() => {}
                () = hub.wait_stopped() => warn!("Hub stopped, closing HTTP listener"),
            }
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }

        // Already stopped here means the broker failure threshold was crossed
        let failed = self.hub.state() == HubState::Stopped;
        self.shutdown().await;

        if failed {
            return Err(anyhow::anyhow!(
                "Hub stopped after {} consecutive broker failures",
                self.hub.stats().error_count
            ));
        }
        Ok(())
    }

    /// Stop the hub, bounded by the configured grace period
    async fn shutdown(&self) {
        info!("Shutting down relayhub...");
        let grace = Duration::from_secs(self.config.server.shutdown_grace_seconds);

        if tokio::time::timeout(grace, self.hub.stop()).await.is_err() {
            warn!(
                "Hub did not stop within {}s (state: {}), exiting anyway",
                grace.as_secs(),
                self.hub.state()
            );
            return;
        }

        info!("relayhub shut down gracefully");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
