use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::envelope::SessionId;

/// Outbound queue of one connection
pub type MessageSender = mpsc::Sender<Bytes>;

/// Registry-side record of one live connection
///
/// Dropping it closes the connection's outbound queue, which makes the
/// connection actor send a Close frame and exit.
#[derive(Debug)]
pub struct Connection {
    sender: MessageSender,
}

impl Connection {
    #[must_use]
    pub const fn new(sender: MessageSender) -> Self {
        Self { sender }
    }

    /// Create a connection record together with the receiving end of its
    /// bounded outbound queue
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

/// Result of a local fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutResult {
    /// Connections the payload was queued for
    pub delivered: usize,
    /// Slow or dead connections that must be unregistered
    pub evicted: Vec<SessionId>,
}

/// Outcome of a targeted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The queue was full or closed; the session must be unregistered
    Evicted,
    NotFound,
}

/// In-process map of live connections
///
/// Writes come only from the hub's coordination loop. Fan-out takes the read
/// lock and never waits on a consumer, so it completes in bounded time no
/// matter how slow individual connections are.
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<SessionId, Connection>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session_id: SessionId, connection: Connection) -> bool {
        let mut connections = self.connections.write();
        if connections.contains_key(&session_id) {
            warn!(session_id = %session_id, "Session already registered, keeping existing connection");
            return false;
        }
        connections.insert(session_id, connection);
        true
    }

    pub(crate) fn remove(&self, session_id: &SessionId) -> Option<Connection> {
        self.connections.write().remove(session_id)
    }

    /// Remove every connection, closing their queues once the returned
    /// records are dropped
    pub(crate) fn drain(&self) -> Vec<(SessionId, Connection)> {
        self.connections.write().drain().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Queue `payload` on every registered connection without waiting
    ///
    /// Connections whose queue is full or closed are reported in
    /// [`FanoutResult::evicted`]; the caller unregisters them after this
    /// returns and the lock is released.
    pub fn fan_out(&self, payload: &Bytes) -> FanoutResult {
        let mut result = FanoutResult::default();
        let connections = self.connections.read();

        for (session_id, connection) in connections.iter() {
            match connection.sender.try_send(payload.clone()) {
                Ok(()) => result.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %session_id, "Outbound queue full, evicting slow consumer");
                    result.evicted.push(session_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %session_id, "Outbound queue closed, evicting connection");
                    result.evicted.push(session_id.clone());
                }
            }
        }

        result
    }

    /// Queue `payload` on one connection without waiting
    pub fn send_to(&self, session_id: &SessionId, payload: Bytes) -> SendOutcome {
        let connections = self.connections.read();
        let Some(connection) = connections.get(session_id) else {
            return SendOutcome::NotFound;
        };

        match connection.sender.try_send(payload) {
            Ok(()) => SendOutcome::Delivered,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Targeted send failed, evicting connection");
                SendOutcome::Evicted
            }
        }
    }
}
