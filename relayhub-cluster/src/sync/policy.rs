//! Timeout and retry wrapping for broker calls

use std::future::Future;
use std::time::Duration;

use relayhub_core::resilience::retry::with_linear_backoff;

use crate::error::{Error, Result};

/// Attempt budget, backoff unit and per-attempt timeout for one kind of
/// broker call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            operation_timeout: relayhub_core::resilience::timeout::REDIS_OPERATION_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or the attempt budget is spent
    pub async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let operation_timeout = self.operation_timeout;
        with_linear_backoff(self.max_attempts, self.backoff_unit, |attempt| {
            let call = op();
            async move {
                let result = with_timeout(operation_timeout, what, call).await;
                if let Err(e) = &result {
                    tracing::debug!(attempt, error = %e, "{what} attempt failed");
                }
                result
            }
        })
        .await
    }
}

/// Bound one broker call by `duration`
pub async fn with_timeout<T>(
    duration: Duration,
    what: &'static str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(duration, call)
        .await
        .map_err(|_| Error::Timeout(format!("{what} timed out after {duration:?}")))?
}
