//! Helpers shared by the unit tests of this crate

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::broker::MemoryBroker;
use crate::sync::hub::{Hub, HubConfig};

/// Poll `condition` until it holds, failing the test after 30 (tokio) seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Hub tuning with short backoff so retry paths finish quickly
pub fn test_config() -> HubConfig {
    HubConfig {
        retry_backoff_unit: Duration::from_millis(100),
        operation_timeout: Duration::from_secs(1),
        ..HubConfig::default()
    }
}

/// Connect a hub to a fresh in-memory broker
pub async fn memory_hub(config: HubConfig) -> (Hub, MemoryBroker) {
    let broker = MemoryBroker::new();
    let hub = Hub::connect(config, Arc::new(broker.clone()), Arc::new(broker.clone()))
        .await
        .expect("memory broker is reachable");
    (hub, broker)
}

/// Connect and start a hub, waiting until its relay subscription is live
pub async fn running_hub(config: HubConfig) -> (Hub, MemoryBroker) {
    let channel = config.channel.clone();
    let (hub, broker) = memory_hub(config).await;
    hub.start();
    broker.wait_for_subscribers(&channel, 1).await;
    (hub, broker)
}
