//! Broker health monitoring
//!
//! Pings the broker on a fixed interval and feeds the shared consecutive
//! failure counter that also tracks subscription failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::sync::policy::with_timeout;

/// Consecutive broker failure count shared by every failure detector
///
/// Exceeding `max_retries` is fatal for the hub.
#[derive(Debug)]
pub struct FailureCounter {
    count: AtomicU32,
    max_retries: u32,
}

impl FailureCounter {
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            max_retries,
        }
    }

    /// Record one failure and return the new count
    pub fn record_failure(&self) -> u32 {
        self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub const fn is_fatal(&self, count: u32) -> bool {
        count > self.max_retries
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Periodic broker ping
pub struct HealthMonitor {
    broker: Arc<dyn Broker>,
    failures: Arc<FailureCounter>,
    check_interval: Duration,
    ping_timeout: Duration,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        failures: Arc<FailureCounter>,
        check_interval: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            failures,
            check_interval,
            ping_timeout,
        }
    }

    /// Run until `cancel_token` fires. Cancels it itself once the failure
    /// counter passes the threshold.
    pub async fn run(self, cancel_token: CancellationToken) {
        // First check one interval after start
        let mut timer = interval_at(Instant::now() + self.check_interval, self.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    tracing::debug!("Health monitor shutting down");
                    return;
                }
                _ = timer.tick() => {}
            }

            let outcome = tokio::select! {
                () = cancel_token.cancelled() => return,
                outcome = with_timeout(self.ping_timeout, "health ping", self.broker.ping()) => outcome,
            };

            match outcome {
                Ok(()) => {
                    let previous = self.failures.get();
                    self.failures.reset();
                    if previous > 0 {
                        tracing::info!(previous_errors = previous, "Broker health check recovered");
                    }
                }
                Err(e) => {
                    let count = self.failures.record_failure();
                    if self.failures.is_fatal(count) {
                        tracing::error!(
                            error = %e,
                            error_count = count,
                            max_retries = self.failures.max_retries(),
                            "Broker health check failed too many times, shutting hub down"
                        );
                        cancel_token.cancel();
                        return;
                    }
                    tracing::warn!(error = %e, error_count = count, "Broker health check failed");
                }
            }
        }
    }
}
