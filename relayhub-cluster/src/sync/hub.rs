//! Distributed connection hub
//!
//! Owns the local registry, the relay bridge, the session directory and the
//! broker health check, and drives them through one lifecycle:
//! `Created -> Running -> ShuttingDown -> Stopped`.
//!
//! Registry mutations happen only on the coordination loop. It takes
//! admissions and removals from a lossless ordered queue, ahead of envelopes
//! from a bounded queue that sheds load when full. Everything that talks to
//! the broker runs on its own task so the loop never waits on I/O.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use relayhub_core::Config;

use super::envelope::{Envelope, InstanceId, Notification, SessionId};
use super::policy::{with_timeout, RetryPolicy};
use super::registry::{Connection, Registry, SendOutcome};
use super::relay::{PublisherWorker, RelayPublisher, RelaySubscriber};
use crate::broker::{Broker, MemoryBroker, RedisBroker, SessionStore};
use crate::discovery::directory::{delete_best_effort, DirectoryWorker, SessionDirectory};
use crate::discovery::health_monitor::{FailureCounter, HealthMonitor};
use crate::error::{Error, Result};

/// Runtime hub tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Shared pub/sub channel
    pub channel: String,
    /// Outbound queue capacity per connection
    pub buffer_size: usize,
    /// Capacity of the envelope, relay publish and directory queues
    pub queue_capacity: usize,
    /// Consecutive broker failures tolerated before shutdown, and the
    /// attempt budget of relay publishes and directory writes
    pub max_retries: u32,
    pub session_ttl: Duration,
    pub health_check_interval: Duration,
    pub operation_timeout: Duration,
    pub retry_backoff_unit: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel: "broadcast".to_string(),
            buffer_size: 256,
            queue_capacity: 10_000,
            max_retries: 3,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            health_check_interval: Duration::from_secs(30),
            operation_timeout: relayhub_core::resilience::timeout::REDIS_OPERATION_TIMEOUT,
            retry_backoff_unit: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        let hub = &config.hub;
        Self {
            channel: hub.channel.clone(),
            buffer_size: hub.buffer_size,
            queue_capacity: hub.queue_capacity,
            max_retries: hub.max_retries,
            session_ttl: Duration::from_secs(hub.session_ttl_seconds),
            health_check_interval: Duration::from_secs(hub.health_check_interval_seconds),
            operation_timeout: Duration::from_secs(hub.operation_timeout_seconds),
            retry_backoff_unit: Duration::from_millis(hub.retry_backoff_millis),
        }
    }
}

impl HubConfig {
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            backoff_unit: self.retry_backoff_unit,
            operation_timeout: self.operation_timeout,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Configuration("buffer_size must be greater than 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Configuration("queue_capacity must be greater than 0".to_string()));
        }
        if self.channel.trim().is_empty() {
            return Err(Error::Configuration("channel must not be empty".to_string()));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::Configuration(
                "health_check_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hub lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time hub statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub active_connections: usize,
    pub pod_id: String,
    pub error_count: u32,
    pub state: HubState,
}

/// Registry change for the coordination loop. Never dropped.
#[derive(Debug)]
pub(crate) enum HubCommand {
    Register {
        session_id: SessionId,
        connection: Connection,
    },
    Unregister(SessionId),
}

/// Envelope for the coordination loop
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Deliver locally and relay to other instances
    Publish(Envelope),
    /// Deliver locally only (envelope came from another instance)
    Relayed(Envelope),
}

/// Bounded queue of envelopes waiting for the coordination loop
#[derive(Debug, Clone)]
pub(crate) struct DeliveryQueue {
    tx: mpsc::Sender<Delivery>,
}

impl DeliveryQueue {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue without waiting. Returns false if the envelope was dropped.
    pub(crate) fn push(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                let (kind, envelope) = match &delivery {
                    Delivery::Publish(envelope) => ("publish", envelope),
                    Delivery::Relayed(envelope) => ("relayed", envelope),
                };
                warn!(
                    kind,
                    session_id = %envelope.session_id,
                    capacity = self.tx.max_capacity(),
                    "Hub delivery queue full, dropping envelope"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub stopped, dropping envelope");
                false
            }
        }
    }
}

/// Receivers and workers created with the hub and spawned by `start`
struct PendingTasks {
    commands: mpsc::UnboundedReceiver<HubCommand>,
    deliveries: mpsc::Receiver<Delivery>,
    directory: DirectoryWorker,
    publisher: PublisherWorker,
}

struct HubInner {
    config: HubConfig,
    instance_id: InstanceId,
    broker: Arc<dyn Broker>,
    store: Arc<dyn SessionStore>,
    registry: Registry,
    failures: Arc<FailureCounter>,
    commands: mpsc::UnboundedSender<HubCommand>,
    deliveries: DeliveryQueue,
    directory: SessionDirectory,
    relay: RelayPublisher,
    state: watch::Sender<HubState>,
    cancel_token: CancellationToken,
    pending: Mutex<Option<PendingTasks>>,
}

/// Handle to a distributed connection hub. Clones share the same hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Build a hub on the given broker and session store
    ///
    /// Pings the broker once; an unreachable broker is a startup error.
    pub async fn connect(
        config: HubConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        config.validate()?;

        with_timeout(config.operation_timeout, "startup ping", broker.ping())
            .await
            .map_err(|e| Error::Broker(format!("Broker unreachable at startup: {e}")))?;

        let instance_id = InstanceId::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (deliveries, deliveries_rx) = DeliveryQueue::new(config.queue_capacity);
        let (directory, directory_worker) =
            SessionDirectory::new(store.clone(), config.retry_policy(), config.queue_capacity);
        let (relay, publisher) = RelayPublisher::new(
            broker.clone(),
            config.channel.clone(),
            config.retry_policy(),
            config.queue_capacity,
        );
        let (state, _) = watch::channel(HubState::Created);

        info!(pod_id = %instance_id, channel = %config.channel, "Hub created");

        Ok(Self {
            inner: Arc::new(HubInner {
                failures: Arc::new(FailureCounter::new(config.max_retries)),
                config,
                instance_id,
                broker,
                store,
                registry: Registry::new(),
                commands: commands_tx,
                deliveries,
                directory,
                relay,
                state,
                cancel_token: CancellationToken::new(),
                pending: Mutex::new(Some(PendingTasks {
                    commands: commands_rx,
                    deliveries: deliveries_rx,
                    directory: directory_worker,
                    publisher,
                })),
            }),
        })
    }

    /// Build a hub from application configuration
    ///
    /// A `memory://` broker URL selects the in-process broker, which only
    /// makes sense for a single instance.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let hub_config = HubConfig::from(config);
        let url = config.redis_url();

        if url.starts_with("memory://") {
            warn!("Using in-process broker, messages will not leave this instance");
            let broker = Arc::new(MemoryBroker::new());
            return Self::connect(hub_config, broker.clone(), broker).await;
        }

        let broker = Arc::new(RedisBroker::connect(url, hub_config.operation_timeout).await?);
        Self::connect(hub_config, broker.clone(), broker).await
    }

    /// Start the coordination loop, relay, directory and health tasks
    ///
    /// Returns immediately. Does nothing if the hub was already started or
    /// stopped.
    pub fn start(&self) {
        let pending = {
            let mut pending = self.inner.pending.lock();
            let Some(tasks) = pending.take() else {
                debug!(pod_id = %self.inner.instance_id, "Hub already started or stopped");
                return;
            };
            self.inner.state.send_replace(HubState::Running);
            tasks
        };

        let inner = &self.inner;
        let cancel = inner.cancel_token.clone();

        let subscriber = RelaySubscriber {
            broker: inner.broker.clone(),
            channel: inner.config.channel.clone(),
            instance_id: inner.instance_id.clone(),
            failures: inner.failures.clone(),
            deliveries: inner.deliveries.clone(),
            backoff_unit: inner.config.retry_backoff_unit,
            subscribe_timeout: inner.config.operation_timeout,
        };
        let monitor = HealthMonitor::new(
            inner.broker.clone(),
            inner.failures.clone(),
            inner.config.health_check_interval,
            inner.config.operation_timeout,
        );

        let tasks = vec![
            tokio::spawn(pending.directory.run(cancel.clone())),
            tokio::spawn(pending.publisher.run(cancel.clone())),
            tokio::spawn(subscriber.run(cancel.clone())),
            tokio::spawn(monitor.run(cancel)),
        ];

        tokio::spawn(inner.clone().run(pending.commands, pending.deliveries, tasks));
        info!(pod_id = %inner.instance_id, "Hub started");
    }

    /// Admit a connection and return its session id
    ///
    /// Admission and the directory write happen asynchronously.
    pub fn register(&self, connection: Connection) -> SessionId {
        let session_id = SessionId::new();
        self.inner.submit(HubCommand::Register {
            session_id: session_id.clone(),
            connection,
        });
        session_id
    }

    /// Remove a connection. Unknown or already removed sessions are ignored.
    pub fn unregister(&self, session_id: &SessionId) {
        self.inner.submit(HubCommand::Unregister(session_id.clone()));
    }

    /// Deliver to every local connection and relay to other instances
    ///
    /// Never waits. Returns false if the envelope was dropped because the
    /// hub is backed up or stopped.
    pub fn publish(&self, envelope: Envelope) -> bool {
        self.inner.deliveries.push(Delivery::Publish(envelope))
    }

    /// Publish a server-originated notification to every connection on
    /// every instance
    pub fn notify(&self, notification: &Notification) -> Result<bool> {
        let payload = notification.to_payload()?;
        debug!(event_type = notification.event_type(), "Publishing notification");
        Ok(self.publish(Envelope::new(
            self.inner.instance_id.clone(),
            SessionId::system(),
            payload,
        )))
    }

    /// Queue `payload` for one local session without waiting
    ///
    /// Returns false when the session is unknown here or its queue is full,
    /// in which case it is evicted.
    pub fn send_to(&self, session_id: &SessionId, payload: impl Into<Bytes>) -> bool {
        match self.inner.registry.send_to(session_id, payload.into()) {
            SendOutcome::Delivered => true,
            SendOutcome::Evicted => {
                self.unregister(session_id);
                false
            }
            SendOutcome::NotFound => false,
        }
    }

    /// Running and the broker answers a ping right now
    ///
    /// Does not touch the failure counter.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != HubState::Running {
            return false;
        }
        with_timeout(
            self.inner.config.operation_timeout,
            "liveness ping",
            self.inner.broker.ping(),
        )
        .await
        .is_ok()
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            active_connections: self.inner.registry.len(),
            pod_id: self.inner.instance_id.to_string(),
            error_count: self.inner.failures.get(),
            state: self.state(),
        }
    }

    /// Shut the hub down and wait until it is stopped. Idempotent.
    pub async fn stop(&self) {
        let never_started = self.inner.pending.lock().take().is_some();

        if never_started {
            // Nothing was spawned, so there is nothing to drain
            if let Err(e) = with_timeout(
                self.inner.config.operation_timeout,
                "broker close",
                self.inner.broker.close(),
            )
            .await
            {
                warn!(error = %e, "Failed to close broker connection");
            }
            self.inner.cancel_token.cancel();
            self.inner.state.send_replace(HubState::Stopped);
            info!(pod_id = %self.inner.instance_id, "Hub stopped before start");
            return;
        }

        self.inner.cancel_token.cancel();
        self.wait_stopped().await;
    }

    #[must_use]
    pub fn state(&self) -> HubState {
        *self.inner.state.borrow()
    }

    /// Resolve once the hub reaches `Stopped`, whether through `stop` or
    /// after too many broker failures
    pub async fn wait_stopped(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = state.wait_for(|s| *s == HubState::Stopped).await;
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// A connection record sized for this hub plus its queue receiver
    #[must_use]
    pub fn new_connection(&self) -> (Connection, mpsc::Receiver<Bytes>) {
        Connection::channel(self.inner.config.buffer_size)
    }
}

impl HubInner {
    fn submit(&self, command: HubCommand) {
        if self.commands.send(command).is_err() {
            debug!(pod_id = %self.instance_id, "Hub stopped, dropping command");
        }
    }

    /// Coordination loop. Runs until the lifecycle token is cancelled, then
    /// performs the shutdown sequence.
    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<HubCommand>,
        mut deliveries: mpsc::Receiver<Delivery>,
        tasks: Vec<JoinHandle<()>>,
    ) {
        loop {
            // Admissions first, so a connection registered before a publish
            // is submitted receives it
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery),
                    None => break,
                },
            }
        }

        // Work still queued (including admissions) is dropped with the
        // receivers, which closes their connection queues.
        drop(commands);
        drop(deliveries);
        self.shutdown(tasks).await;
    }

    fn handle(&self, command: HubCommand) {
        match command {
            HubCommand::Register {
                session_id,
                connection,
            } => {
                if self.registry.insert(session_id.clone(), connection) {
                    self.directory
                        .put(&session_id, &self.instance_id, self.config.session_ttl);
                    info!(
                        session_id = %session_id,
                        active_connections = self.registry.len(),
                        "Connection registered"
                    );
                }
            }
            HubCommand::Unregister(session_id) => {
                if let Some(connection) = self.registry.remove(&session_id) {
                    drop(connection);
                    self.directory.delete(&session_id);
                    info!(
                        session_id = %session_id,
                        active_connections = self.registry.len(),
                        "Connection unregistered"
                    );
                } else {
                    trace!(session_id = %session_id, "Session already unregistered");
                }
            }
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        match delivery {
            Delivery::Publish(envelope) => {
                self.deliver_local(&envelope);
                self.relay.relay(envelope);
            }
            Delivery::Relayed(envelope) => self.deliver_local(&envelope),
        }
    }

    fn deliver_local(&self, envelope: &Envelope) {
        let result = self.registry.fan_out(&envelope.data);
        trace!(
            session_id = %envelope.session_id,
            origin = %envelope.pod_id,
            delivered = result.delivered,
            evicted = result.evicted.len(),
            "Envelope delivered locally"
        );
        for session_id in result.evicted {
            self.submit(HubCommand::Unregister(session_id));
        }
    }

    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        self.state.send_replace(HubState::ShuttingDown);
        info!(
            pod_id = %self.instance_id,
            error_count = self.failures.get(),
            "Hub shutting down"
        );

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Hub task ended abnormally");
            }
        }

        let sessions: Vec<SessionId> = self
            .registry
            .drain()
            .into_iter()
            .map(|(session_id, _connection)| session_id)
            .collect();

        let deleted =
            delete_best_effort(self.store.as_ref(), &sessions, self.config.operation_timeout).await;

        if let Err(e) = with_timeout(
            self.config.operation_timeout,
            "broker close",
            self.broker.close(),
        )
        .await
        {
            warn!(error = %e, "Failed to close broker connection");
        }

        self.state.send_replace(HubState::Stopped);
        info!(
            pod_id = %self.instance_id,
            closed_connections = sessions.len(),
            directory_entries_deleted = deleted,
            "Hub stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StoreOp;
    use crate::sync::envelope::NotificationLevel;
    use crate::test_support::{eventually, memory_hub, running_hub, test_config};

    async fn register_all(hub: &Hub, count: usize) -> Vec<(SessionId, mpsc::Receiver<Bytes>)> {
        let expected = hub.stats().active_connections + count;
        let mut connections = Vec::new();
        for _ in 0..count {
            let (connection, rx) = hub.new_connection();
            connections.push((hub.register(connection), rx));
        }
        eventually(|| hub.stats().active_connections == expected).await;
        connections
    }

    #[test]
    fn test_hub_config_from_app_config() {
        let mut config = Config::default();
        config.hub.retry_backoff_millis = 250;
        config.hub.buffer_size = 8;

        let hub_config = HubConfig::from(&config);
        assert_eq!(hub_config.buffer_size, 8);
        assert_eq!(hub_config.retry_backoff_unit, Duration::from_millis(250));
        assert_eq!(hub_config.session_ttl, Duration::from_secs(86400));
        assert_eq!(hub_config.retry_policy().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_connect_fails_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_ping_failure(true);

        let result = Hub::connect(HubConfig::default(), Arc::new(broker.clone()), Arc::new(broker)).await;
        assert!(matches!(result, Err(Error::Broker(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_buffer() {
        let broker = MemoryBroker::new();
        let config = HubConfig {
            buffer_size: 0,
            ..HubConfig::default()
        };
        let result = Hub::connect(config, Arc::new(broker.clone()), Arc::new(broker)).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_stop_before_start() {
        let (hub, broker) = memory_hub(test_config()).await;
        assert_eq!(hub.state(), HubState::Created);
        assert!(!hub.is_healthy().await);

        hub.stop().await;
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(broker.is_closed());

        // Terminal
        hub.start();
        assert_eq!(hub.state(), HubState::Stopped);
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_reaches_each_local_connection_exactly_once() {
        let (hub, broker) = running_hub(test_config()).await;
        let mut tap = broker.tap(&hub.config().channel);
        let mut connections = register_all(&hub, 3).await;

        let sender = connections[0].0.clone();
        hub.publish(Envelope::new(hub.instance_id().clone(), sender, "hello"));

        for (_, rx) in &mut connections {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
        }

        // Relayed exactly once, and the echo coming back is not delivered again
        let relayed = Envelope::from_json(&tap.recv().await.unwrap()).unwrap();
        assert!(relayed.is_from(hub.instance_id()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(tap.try_recv().is_err());
        for (_, rx) in &mut connections {
            assert!(rx.try_recv().is_err());
        }

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayed_envelopes_from_other_instances_are_delivered() {
        let (hub, broker) = running_hub(test_config()).await;
        let mut connections = register_all(&hub, 2).await;
        let channel = hub.config().channel.clone();

        let own = Envelope::new(hub.instance_id().clone(), SessionId::new(), "echo");
        let foreign = Envelope::new(InstanceId::new(), SessionId::new(), "remote");
        broker.inject(&channel, own.to_json().unwrap());
        broker.inject(&channel, foreign.to_json().unwrap());

        for (_, rx) in &mut connections {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"remote"));
            assert!(rx.try_recv().is_err());
        }

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_is_evicted_without_blocking_others() {
        let config = HubConfig {
            buffer_size: 1,
            ..test_config()
        };
        let (hub, _broker) = running_hub(config).await;
        let mut connections = register_all(&hub, 3).await;

        let blocked = connections[0].0.clone();
        assert!(hub.send_to(&blocked, "backlog"));

        hub.publish(Envelope::new(hub.instance_id().clone(), SessionId::system(), "news"));

        for (_, rx) in connections.iter_mut().skip(1) {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"news"));
        }

        let (_, blocked_rx) = &mut connections[0];
        assert_eq!(blocked_rx.recv().await.unwrap(), Bytes::from_static(b"backlog"));
        assert!(blocked_rx.recv().await.is_none());
        eventually(|| hub.stats().active_connections == 2).await;

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_entry_follows_registration() {
        let (hub, broker) = running_hub(test_config()).await;
        let (connection, _rx) = hub.new_connection();
        let session_id = hub.register(connection);
        let key = session_id.directory_key();

        eventually(|| broker.get(&key).is_some()).await;
        assert_eq!(broker.get(&key).as_deref(), Some(hub.instance_id().as_str()));
        let ttl = broker.ttl(&key).unwrap();
        assert!(ttl > Duration::from_secs(24 * 60 * 60 - 1));

        hub.unregister(&session_id);
        eventually(|| broker.get(&key).is_none()).await;

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_is_idempotent() {
        let (hub, broker) = running_hub(test_config()).await;
        let mut connections = register_all(&hub, 1).await;
        let (session_id, rx) = &mut connections[0];

        hub.unregister(session_id);
        hub.unregister(session_id);
        hub.unregister(&SessionId::new());

        assert!(rx.recv().await.is_none());
        let key = session_id.directory_key();
        eventually(|| broker.store_ops().contains(&StoreOp::Del { key: key.clone() })).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let deletes = broker
            .store_ops()
            .into_iter()
            .filter(|op| matches!(op, StoreOp::Del { .. }))
            .count();
        assert_eq!(deletes, 1);
        assert_eq!(hub.stats().active_connections, 0);

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_failures_past_threshold_stop_the_hub() {
        let (hub, broker) = running_hub(test_config()).await;
        let mut connections = register_all(&hub, 2).await;
        broker.set_ping_failure(true);

        // Health checks at 30s, 60s and 90s fail but stay within max_retries
        tokio::time::sleep(Duration::from_secs(95)).await;
        let stats = hub.stats();
        assert_eq!(stats.error_count, 3);
        assert_eq!(stats.state, HubState::Running);

        // The fourth failure is fatal
        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::time::timeout(Duration::from_secs(10), hub.wait_stopped())
            .await
            .unwrap();
        assert_eq!(hub.state(), HubState::Stopped);
        assert_eq!(hub.stats().active_connections, 0);
        assert!(broker.is_closed());

        for (_, rx) in &mut connections {
            assert!(rx.recv().await.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failures_past_threshold_stop_the_hub() {
        let (hub, broker) = memory_hub(test_config()).await;
        broker.set_subscribe_failure(true);

        hub.start();
        tokio::time::timeout(Duration::from_secs(10), hub.wait_stopped())
            .await
            .unwrap();

        assert_eq!(hub.stats().error_count, 4);
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_healthy_has_no_side_effects() {
        let (hub, broker) = running_hub(test_config()).await;
        assert!(hub.is_healthy().await);

        broker.set_ping_failure(true);
        assert!(!hub.is_healthy().await);
        assert!(!hub.is_healthy().await);
        assert_eq!(hub.stats().error_count, 0);
        assert_eq!(hub.state(), HubState::Running);

        broker.set_ping_failure(false);
        hub.stop().await;
        assert!(!hub.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_connections_and_clears_directory() {
        let (hub, broker) = running_hub(test_config()).await;
        let mut connections = register_all(&hub, 2).await;
        for (session_id, _) in &connections {
            let key = session_id.directory_key();
            eventually(|| broker.get(&key).is_some()).await;
        }

        hub.stop().await;
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(broker.is_closed());
        for (session_id, rx) in &mut connections {
            assert!(rx.recv().await.is_none());
            assert!(broker.get(&session_id.directory_key()).is_none());
        }

        // Second stop returns immediately
        hub.stop().await;

        // Registering after stop hands back a closed queue
        let (connection, mut rx) = hub.new_connection();
        hub.register(connection);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_is_delivered_and_relayed() {
        let (hub, broker) = running_hub(test_config()).await;
        let mut tap = broker.tap(&hub.config().channel);
        let mut connections = register_all(&hub, 1).await;

        let notification = Notification::System {
            message: "maintenance at noon".to_string(),
            level: NotificationLevel::Warning,
            timestamp: chrono::Utc::now(),
        };
        assert!(hub.notify(&notification).unwrap());

        let payload = connections[0].1.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "system");
        assert_eq!(value["message"], "maintenance at noon");

        let relayed = Envelope::from_json(&tap.recv().await.unwrap()).unwrap();
        assert_eq!(relayed.session_id, SessionId::system());
        assert_eq!(relayed.data, payload);

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_targets_one_session() {
        let (hub, _broker) = running_hub(test_config()).await;
        let mut connections = register_all(&hub, 2).await;

        assert!(hub.send_to(&connections[1].0, "just you"));
        assert!(!hub.send_to(&SessionId::new(), "nobody"));

        assert_eq!(connections[1].1.recv().await.unwrap(), Bytes::from_static(b"just you"));
        assert!(connections[0].1.try_recv().is_err());

        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_delivery_queue_drops_envelopes_but_not_admissions() {
        let config = HubConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let (hub, broker) = memory_hub(config).await;
        let mut tap = broker.tap(&hub.config().channel);

        // Not started, so nothing drains the queues yet
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (connection, rx) = hub.new_connection();
            hub.register(connection);
            receivers.push(rx);
        }
        let sender = SessionId::new();
        let accepted: Vec<bool> = ["one", "two", "three"]
            .into_iter()
            .map(|text| hub.publish(Envelope::new(hub.instance_id().clone(), sender.clone(), text)))
            .collect();
        assert_eq!(accepted, vec![true, true, false]);

        hub.start();
        eventually(|| hub.stats().active_connections == 3).await;
        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        }
        for _ in 0..2 {
            tap.recv().await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        for rx in &mut receivers {
            assert!(rx.try_recv().is_err());
        }
        assert!(tap.try_recv().is_err());

        // Drained queue accepts again
        assert!(hub.publish(Envelope::new(hub.instance_id().clone(), sender, "four")));
        assert_eq!(receivers[0].recv().await.unwrap(), Bytes::from_static(b"four"));

        hub.stop().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_queue_capacity() {
        let broker = MemoryBroker::new();
        let config = HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        };
        let result = Hub::connect(config, Arc::new(broker.clone()), Arc::new(broker)).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
