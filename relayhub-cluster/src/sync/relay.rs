//! Cross-instance relay over the shared broker channel
//!
//! Outbound envelopes go through a bounded queue to one publisher task so a
//! broker outage never blocks local delivery. Inbound envelopes arrive on a
//! long-lived subscription; envelopes this instance published itself are
//! discarded.

use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use relayhub_core::resilience::retry::linear_backoff;

use super::envelope::{Envelope, InstanceId};
use super::hub::{Delivery, DeliveryQueue};
use super::policy::{with_timeout, RetryPolicy};
use crate::broker::Broker;
use crate::discovery::health_monitor::FailureCounter;
use crate::error::Error;

/// Non-blocking handle for relaying envelopes to other instances
#[derive(Debug, Clone)]
pub struct RelayPublisher {
    queue: mpsc::Sender<Envelope>,
}

impl RelayPublisher {
    /// Envelopes are dropped with a warning while the queue holds
    /// `capacity` of them (e.g. during a prolonged broker outage).
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        channel: String,
        policy: RetryPolicy,
        capacity: usize,
    ) -> (Self, PublisherWorker) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = PublisherWorker {
            queue: rx,
            broker,
            channel,
            policy,
        };
        (Self { queue: tx }, worker)
    }

    /// Queue `envelope` for publishing. Returns false if it was dropped.
    pub fn relay(&self, envelope: Envelope) -> bool {
        match self.queue.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!(
                    session_id = %envelope.session_id,
                    capacity = self.queue.max_capacity(),
                    "Relay queue full, dropping envelope"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Relay publisher stopped, dropping envelope");
                false
            }
        }
    }
}

/// Publishes queued envelopes, retrying each with linear backoff
pub struct PublisherWorker {
    queue: mpsc::Receiver<Envelope>,
    broker: Arc<dyn Broker>,
    channel: String,
    policy: RetryPolicy,
}

impl PublisherWorker {
    pub async fn run(mut self, cancel_token: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                () = cancel_token.cancelled() => break,
                envelope = self.queue.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let payload = match envelope.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "Failed to serialize envelope for relay");
                    continue;
                }
            };

            let result = tokio::select! {
                () = cancel_token.cancelled() => break,
                result = self.policy.run("relay publish", || {
                    self.broker.publish(&self.channel, payload.clone())
                }) => result,
            };

            match result {
                Ok(()) => trace!(session_id = %envelope.session_id, "Envelope relayed"),
                Err(e) => warn!(
                    session_id = %envelope.session_id,
                    attempts = self.policy.max_attempts,
                    error = %e,
                    "Failed to relay envelope, dropping it"
                ),
            }
        }

        debug!("Relay publisher stopped");
    }
}

enum SubscriptionExit {
    Cancelled,
    ConnectFailed(Error),
    Disconnected,
}

/// Long-lived subscription on the shared channel
pub(crate) struct RelaySubscriber {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) channel: String,
    pub(crate) instance_id: InstanceId,
    pub(crate) failures: Arc<FailureCounter>,
    pub(crate) deliveries: DeliveryQueue,
    pub(crate) backoff_unit: Duration,
    pub(crate) subscribe_timeout: Duration,
}

impl RelaySubscriber {
    /// Subscribe and resubscribe until cancelled. Every failed attempt counts
    /// against the shared failure counter; once it passes the threshold the
    /// token is cancelled, which shuts the hub down.
    pub(crate) async fn run(self, cancel_token: CancellationToken) {
        loop {
            let error = match self.run_subscription(&cancel_token).await {
                SubscriptionExit::Cancelled => break,
                SubscriptionExit::ConnectFailed(e) => e.to_string(),
                SubscriptionExit::Disconnected => "subscription stream ended".to_string(),
            };

            let count = self.failures.record_failure();
            if self.failures.is_fatal(count) {
                error!(
                    channel = %self.channel,
                    error = %error,
                    error_count = count,
                    max_retries = self.failures.max_retries(),
                    "Relay subscription failed too many times, shutting hub down"
                );
                cancel_token.cancel();
                break;
            }

            let backoff = linear_backoff(count, self.backoff_unit);
            warn!(
                channel = %self.channel,
                error = %error,
                error_count = count,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "Relay subscription failed, retrying after backoff"
            );

            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
        }

        debug!(channel = %self.channel, "Relay subscriber stopped");
    }

    async fn run_subscription(&self, cancel_token: &CancellationToken) -> SubscriptionExit {
        let subscribe = with_timeout(
            self.subscribe_timeout,
            "relay subscribe",
            self.broker.subscribe(&self.channel),
        );
        let mut stream = tokio::select! {
            () = cancel_token.cancelled() => return SubscriptionExit::Cancelled,
            result = subscribe => match result {
                Ok(stream) => stream,
                Err(e) => return SubscriptionExit::ConnectFailed(e),
            },
        };

        self.failures.reset();
        info!(channel = %self.channel, pod_id = %self.instance_id, "Relay subscription established");

        loop {
            let item = tokio::select! {
                () = cancel_token.cancelled() => return SubscriptionExit::Cancelled,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(payload)) => self.handle_payload(&payload),
                Some(Err(e)) => warn!(error = %e, "Unreadable relay message, skipping"),
                None => return SubscriptionExit::Disconnected,
            }
        }
    }

    fn handle_payload(&self, payload: &str) {
        let envelope = match Envelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Malformed relay envelope, skipping");
                return;
            }
        };

        if envelope.is_from(&self.instance_id) {
            trace!(session_id = %envelope.session_id, "Skipping own relayed envelope");
            return;
        }

        self.deliveries.push(Delivery::Relayed(envelope));
    }
}
