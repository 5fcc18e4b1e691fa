//! Distributed session directory
//!
//! Maps `session:<id>` to the instance holding that session, with a TTL so
//! entries of a crashed instance expire on their own. Nothing reads the
//! directory here; other services use it to locate sessions.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::SessionStore;
use crate::sync::envelope::{InstanceId, SessionId};
use crate::sync::policy::{with_timeout, RetryPolicy};

#[derive(Debug)]
enum DirectoryOp {
    Put {
        session_id: SessionId,
        instance_id: InstanceId,
        ttl: Duration,
    },
    Delete {
        session_id: SessionId,
    },
}

/// Handle for queueing directory writes
///
/// Operations run in submission order on one [`DirectoryWorker`], so a
/// session's delete never overtakes its put. Failures are logged and
/// otherwise ignored. The queue is bounded; when a broker outage backs it
/// up, new operations are dropped and their entries are left to the TTL.
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    ops: mpsc::Sender<DirectoryOp>,
}

impl SessionDirectory {
    /// Create the handle and the worker that executes its operations
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        policy: RetryPolicy,
        capacity: usize,
    ) -> (Self, DirectoryWorker) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { ops: tx }, DirectoryWorker { ops: rx, store, policy })
    }

    /// Record that `session_id` lives on `instance_id`. Returns false if
    /// the operation was dropped.
    pub fn put(&self, session_id: &SessionId, instance_id: &InstanceId, ttl: Duration) -> bool {
        self.submit(DirectoryOp::Put {
            session_id: session_id.clone(),
            instance_id: instance_id.clone(),
            ttl,
        })
    }

    pub fn delete(&self, session_id: &SessionId) -> bool {
        self.submit(DirectoryOp::Delete {
            session_id: session_id.clone(),
        })
    }

    fn submit(&self, op: DirectoryOp) -> bool {
        match self.ops.try_send(op) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(op)) => {
                tracing::warn!(
                    op = ?op,
                    capacity = self.ops.max_capacity(),
                    "Session directory queue full, dropping operation"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Session directory worker stopped, dropping operation");
                false
            }
        }
    }
}

/// Executes directory operations one at a time with retry
pub struct DirectoryWorker {
    ops: mpsc::Receiver<DirectoryOp>,
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
}

impl DirectoryWorker {
    pub async fn run(mut self, cancel_token: CancellationToken) {
        loop {
            let op = tokio::select! {
                () = cancel_token.cancelled() => break,
                op = self.ops.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };

            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = self.execute(op) => {}
            }
        }

        tracing::debug!("Session directory worker stopped");
    }

    async fn execute(&self, op: DirectoryOp) {
        match op {
            DirectoryOp::Put {
                session_id,
                instance_id,
                ttl,
            } => {
                let key = session_id.directory_key();
                let result = self
                    .policy
                    .run("directory put", || {
                        self.store.set_ex(&key, instance_id.as_str(), ttl)
                    })
                    .await;

                match result {
                    Ok(()) => tracing::debug!(session_id = %session_id, ttl_secs = ttl.as_secs(), "Session directory entry written"),
                    Err(e) => tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to write session directory entry, giving up"
                    ),
                }
            }
            DirectoryOp::Delete { session_id } => {
                let key = session_id.directory_key();
                let result = self
                    .policy
                    .run("directory delete", || self.store.del(&key))
                    .await;

                match result {
                    Ok(()) => tracing::debug!(session_id = %session_id, "Session directory entry deleted"),
                    Err(e) => tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to delete session directory entry, it will expire"
                    ),
                }
            }
        }
    }
}

/// Delete the entries of `sessions` concurrently, one attempt each
///
/// Used on shutdown, where whatever is left behind expires via TTL.
pub async fn delete_best_effort(
    store: &dyn SessionStore,
    sessions: &[SessionId],
    operation_timeout: Duration,
) -> usize {
    let deletes = sessions.iter().map(|session_id| async move {
        let key = session_id.directory_key();
        match with_timeout(operation_timeout, "directory delete", store.del(&key)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Shutdown directory delete failed");
                false
            }
        }
    });

    futures::future::join_all(deletes)
        .await
        .into_iter()
        .filter(|deleted| *deleted)
        .count()
}
