use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Broker, SessionStore};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

/// Session store operation, recorded in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set { key: String, value: String, ttl: Duration },
    Del { key: String },
}

/// In-process broker and session store
///
/// Channels are tokio broadcast channels and keys expire on the tokio clock,
/// so paused-time tests see TTLs elapse. Every operation can be made to fail
/// on demand, and live subscriptions can be dropped to simulate a lost
/// connection. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    keys: Mutex<HashMap<String, (String, Instant)>>,
    store_ops: Mutex<Vec<StoreOp>>,
    subscriptions: Mutex<CancellationToken>,
    fail_ping: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_store: AtomicBool,
    closed: AtomicBool,
    pings: AtomicU32,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.inner.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_store_failure(&self, fail: bool) {
        self.inner.fail_store.store(fail, Ordering::SeqCst);
    }

    /// End every live subscription stream, as if the connection dropped
    pub fn drop_subscriptions(&self) {
        let mut token = self.inner.subscriptions.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Publish a raw payload as another instance would, bypassing failure injection
    pub fn inject(&self, channel: &str, payload: impl Into<String>) -> usize {
        self.sender(channel).send(payload.into()).unwrap_or(0)
    }

    /// Open a raw subscription, bypassing failure injection
    pub fn tap(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Wait until at least `count` subscribers listen on `channel`
    pub async fn wait_for_subscribers(&self, channel: &str, count: usize) {
        while self.subscriber_count(channel) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Current value of a key, honouring expiry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let keys = self.inner.keys.lock();
        keys.get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone())
    }

    /// Remaining time to live of a key
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let keys = self.inner.keys.lock();
        keys.get(key)
            .and_then(|(_, expires_at)| expires_at.checked_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    #[must_use]
    pub fn store_ops(&self) -> Vec<StoreOp> {
        self.inner.store_ops.lock().clone()
    }

    #[must_use]
    pub fn ping_count(&self) -> u32 {
        self.inner.pings.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn check(&self, fail: &AtomicBool, what: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if fail.load(Ordering::SeqCst) {
            return Err(Error::Broker(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.inner.pings.fetch_add(1, Ordering::SeqCst);
        self.check(&self.inner.fail_ping, "ping")
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.check(&self.inner.fail_publish, "publish")?;
        // No subscribers is not an error, same as Redis PUBLISH
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Result<String>>> {
        self.check(&self.inner.fail_subscribe, "subscribe")?;

        let receiver = self.sender(channel).subscribe();
        let dropped = self.inner.subscriptions.lock().clone();

        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((Ok(payload), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Memory subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(messages.take_until(dropped.cancelled_owned()).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscriptions.lock().cancel();
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryBroker {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check(&self.inner.fail_store, "set")?;
        self.inner.store_ops.lock().push(StoreOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        self.inner
            .keys
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check(&self.inner.fail_store, "del")?;
        self.inner.store_ops.lock().push(StoreOp::Del { key: key.to_string() });
        self.inner.keys.lock().remove(key);
        Ok(())
    }
}
