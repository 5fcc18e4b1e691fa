use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{Broker, SessionStore};
use crate::error::{Error, Result};

/// Redis-backed broker and session store
///
/// Commands share one multiplexed connection. Each subscription opens its
/// own pub/sub connection, which is torn down when the broker is closed.
pub struct RedisBroker {
    client: RedisClient,
    conn: Mutex<Option<MultiplexedConnection>>,
    closing: CancellationToken,
}

impl RedisBroker {
    /// Open a client for `url` and establish the command connection
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        tracing::info!("Connected to Redis");

        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            closing: CancellationToken::new(),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn.lock().clone().ok_or(Error::Closed)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.connection()?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::trace!(channel, receivers, "Published to Redis channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Result<String>>> {
        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(Error::from))
            .take_until(self.closing.clone().cancelled_owned());

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closing.cancel();
        if self.conn.lock().take().is_some() {
            tracing::info!("Redis connection released");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisBroker {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
