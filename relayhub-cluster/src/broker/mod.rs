//! Broker backends
//!
//! The hub talks to its shared publish/subscribe broker and to the session
//! directory store only through the two traits below, so Redis and the
//! in-process [`MemoryBroker`] are interchangeable.

mod memory;
mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::Result;

pub use memory::{MemoryBroker, StoreOp};
pub use self::redis::RedisBroker;

/// Shared publish/subscribe channel
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Round-trip liveness check
    async fn ping(&self) -> Result<()>;

    /// Publish one payload on `channel`
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to `channel`
    ///
    /// The returned stream yields every payload published after the call
    /// returns and ends when the underlying connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Result<String>>>;

    /// Release the connection. Every later operation fails with `Error::Closed`.
    async fn close(&self) -> Result<()>;
}

/// Key/value store with expiry backing the session directory
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;
}
