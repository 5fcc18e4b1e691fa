//! Connection actor
//!
//! Drives one client stream with two tasks sharing the connection's bounded
//! outbound queue: the inbound task turns frames into published envelopes
//! and enforces the read deadline, the outbound task drains the queue and
//! keeps the peer alive with pings. Either task may notice failure first;
//! the close guard makes sure the connection is torn down once.

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayhub_core::config::ConnectionSettings;

use super::envelope::{Envelope, SessionId};
use super::hub::Hub;

/// Transport-neutral stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl Frame {
    /// Outbound frame for a queued payload: text when it is UTF-8
    #[must_use]
    pub fn from_payload(payload: Bytes) -> Self {
        match std::str::from_utf8(&payload) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Binary(payload),
        }
    }
}

/// Per-connection stream limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_frame_bytes: usize,
    /// Inactivity deadline, refreshed by every Pong
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Must be shorter than `read_timeout`
    pub ping_interval: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 512,
            read_timeout: relayhub_core::resilience::timeout::STREAM_READ_TIMEOUT,
            write_timeout: relayhub_core::resilience::timeout::STREAM_WRITE_TIMEOUT,
            ping_interval: Duration::from_secs(54),
        }
    }
}

impl From<&ConnectionSettings> for ConnectionLimits {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            max_frame_bytes: settings.max_frame_bytes,
            read_timeout: Duration::from_secs(settings.read_timeout_seconds),
            write_timeout: Duration::from_secs(settings.write_timeout_seconds),
            ping_interval: Duration::from_secs(settings.ping_interval_seconds),
        }
    }
}

/// Closes a connection exactly once
#[derive(Debug, Default)]
struct CloseGuard {
    closed: AtomicBool,
    token: CancellationToken,
}

impl CloseGuard {
    /// Returns true only for the first caller
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    async fn closed(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Sink(String),
}

/// Actor for one client stream
pub struct ConnectionActor<S, R> {
    hub: Hub,
    limits: ConnectionLimits,
    sink: S,
    stream: R,
}

/// Running connection
pub struct ConnectionHandle {
    session_id: SessionId,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl ConnectionHandle {
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wait for both tasks to finish
    pub async fn join(self) {
        for (task, result) in [("inbound", self.inbound.await), ("outbound", self.outbound.await)] {
            if let Err(e) = result {
                warn!(session_id = %self.session_id, task, error = %e, "Connection task ended abnormally");
            }
        }
    }
}

impl<S, R, E> ConnectionActor<S, R>
where
    S: Sink<Frame> + Send + Unpin + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    pub fn new(hub: Hub, limits: ConnectionLimits, sink: S, stream: R) -> Self {
        Self {
            hub,
            limits,
            sink,
            stream,
        }
    }

    /// Register with the hub and start the inbound and outbound tasks
    pub fn spawn(self) -> ConnectionHandle {
        let (connection, queue) = self.hub.new_connection();
        let session_id = self.hub.register(connection);
        let guard = Arc::new(CloseGuard::default());

        info!(session_id = %session_id, "Connection opened");

        let inbound = tokio::spawn(read_loop(
            self.hub.clone(),
            session_id.clone(),
            self.limits.clone(),
            self.stream,
            guard.clone(),
        ));
        let outbound = tokio::spawn(write_loop(
            self.hub,
            session_id.clone(),
            self.limits,
            self.sink,
            queue,
            guard,
        ));

        ConnectionHandle {
            session_id,
            inbound,
            outbound,
        }
    }
}

/// Request unregistration and close, unless someone already did
fn shut(hub: &Hub, session_id: &SessionId, guard: &CloseGuard, reason: &str) {
    if guard.close() {
        debug!(session_id = %session_id, reason, "Closing connection");
        hub.unregister(session_id);
    }
}

async fn read_loop<R, E>(
    hub: Hub,
    session_id: SessionId,
    limits: ConnectionLimits,
    mut stream: R,
    guard: Arc<CloseGuard>,
) where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + limits.read_timeout;

    let reason = loop {
        let next = tokio::select! {
            () = guard.closed() => return,
            next = timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => break "read deadline expired",
            Ok(None) => break "stream ended",
            Ok(Some(Err(e))) => {
                debug!(session_id = %session_id, error = %e, "Read error");
                break "read error";
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let data = match frame {
            Frame::Text(text) => Bytes::from(text),
            Frame::Binary(data) => data,
            Frame::Pong(_) => {
                deadline = Instant::now() + limits.read_timeout;
                continue;
            }
            // Answered by the transport
            Frame::Ping(_) => continue,
            Frame::Close => break "peer closed",
        };

        if data.len() > limits.max_frame_bytes {
            warn!(
                session_id = %session_id,
                size = data.len(),
                max = limits.max_frame_bytes,
                "Frame exceeds size limit"
            );
            break "frame too large";
        }

        hub.publish(Envelope::new(hub.instance_id().clone(), session_id.clone(), data));
    };

    shut(&hub, &session_id, &guard, reason);
}

async fn write_loop<S>(
    hub: Hub,
    session_id: SessionId,
    limits: ConnectionLimits,
    mut sink: S,
    mut queue: mpsc::Receiver<Bytes>,
    guard: Arc<CloseGuard>,
) where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + limits.ping_interval, limits.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = guard.closed() => {
                // Closed from the read side; tell the peer
                if let Err(e) = write(&mut sink, Frame::Close, limits.write_timeout).await {
                    debug!(session_id = %session_id, error = %e, "Failed to send close frame");
                }
                break;
            }
            message = queue.recv() => {
                let Some(first) = message else {
                    // Unregistered by the hub
                    guard.close();
                    if let Err(e) = write(&mut sink, Frame::Close, limits.write_timeout).await {
                        debug!(session_id = %session_id, error = %e, "Failed to send close frame");
                    }
                    break;
                };

                let frame = Frame::from_payload(coalesce(first, &mut queue));
                if let Err(e) = write(&mut sink, frame, limits.write_timeout).await {
                    warn!(session_id = %session_id, error = %e, "Write to client failed");
                    shut(&hub, &session_id, &guard, "write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if !queue.is_empty() {
                    continue;
                }
                if let Err(e) = write(&mut sink, Frame::Ping(Bytes::new()), limits.write_timeout).await {
                    warn!(session_id = %session_id, error = %e, "Ping to client failed");
                    shut(&hub, &session_id, &guard, "ping failed");
                    break;
                }
            }
        }
    }

    if let Ok(Err(e)) = timeout(limits.write_timeout, sink.close()).await {
        debug!(session_id = %session_id, error = %e, "Error closing client stream");
    }
    info!(session_id = %session_id, "Connection closed");
}

async fn write<S>(sink: &mut S, frame: Frame, deadline: Duration) -> Result<(), WriteError>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Sink(e.to_string())),
        Err(_) => Err(WriteError::Timeout(deadline)),
    }
}

/// Join `first` with every payload already waiting in the queue, newline
/// separated
fn coalesce(first: Bytes, queue: &mut mpsc::Receiver<Bytes>) -> Bytes {
    let pending = queue.len();
    if pending == 0 {
        return first;
    }

    let mut buffer = BytesMut::from(&first[..]);
    for _ in 0..pending {
        let Ok(next) = queue.try_recv() else { break };
        buffer.extend_from_slice(b"\n");
        buffer.extend_from_slice(&next);
    }
    buffer.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eventually, running_hub, test_config};
    use futures::channel::mpsc as fmpsc;

    struct Peer {
        to_server: fmpsc::UnboundedSender<Result<Frame, std::io::Error>>,
        from_server: fmpsc::UnboundedReceiver<Frame>,
    }

    impl Peer {
        fn send(&self, frame: Frame) {
            self.to_server.unbounded_send(Ok(frame)).unwrap();
        }

        /// Frames received up to and including the first Close
        async fn until_close(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Some(frame) = self.from_server.next().await {
                let done = frame == Frame::Close;
                frames.push(frame);
                if done {
                    break;
                }
            }
            frames
        }
    }

    fn connect(hub: &Hub) -> (ConnectionHandle, Peer) {
        let (to_server, server_stream) = fmpsc::unbounded();
        let (server_sink, from_server) = fmpsc::unbounded();
        let handle =
            ConnectionActor::new(hub.clone(), ConnectionLimits::default(), server_sink, server_stream)
                .spawn();
        (handle, Peer { to_server, from_server })
    }

    #[test]
    fn test_coalesce_pending_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(Bytes::from_static(b"b")).unwrap();
        tx.try_send(Bytes::from_static(b"c")).unwrap();

        let joined = coalesce(Bytes::from_static(b"a"), &mut rx);
        assert_eq!(joined, Bytes::from_static(b"a\nb\nc"));
        assert!(rx.try_recv().is_err());

        assert_eq!(coalesce(Bytes::from_static(b"solo"), &mut rx), Bytes::from_static(b"solo"));
    }

    #[test]
    fn test_frame_from_payload() {
        assert_eq!(Frame::from_payload(Bytes::from_static(b"hi")), Frame::Text("hi".to_string()));
        assert_eq!(
            Frame::from_payload(Bytes::from_static(&[0xff, 0xfe])),
            Frame::Binary(Bytes::from_static(&[0xff, 0xfe]))
        );
    }

    #[test]
    fn test_limits_from_settings() {
        let limits = ConnectionLimits::from(&ConnectionSettings::default());
        assert_eq!(limits, ConnectionLimits::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_are_published_to_local_connections() {
        let (hub, _broker) = running_hub(test_config()).await;
        let (listener, mut listener_rx) = hub.new_connection();
        hub.register(listener);

        let (handle, mut peer) = connect(&hub);
        eventually(|| hub.stats().active_connections == 2).await;

        peer.send(Frame::Text("hi there".to_string()));
        assert_eq!(listener_rx.recv().await.unwrap(), Bytes::from_static(b"hi there"));
        // The sender is a local connection too
        assert_eq!(peer.from_server.next().await.unwrap(), Frame::Text("hi there".to_string()));

        hub.unregister(handle.session_id());
        assert_eq!(peer.until_close().await.last(), Some(&Frame::Close));
        handle.join().await;
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_payload_is_published_unchanged() {
        let (hub, _broker) = running_hub(test_config()).await;
        let (listener, mut listener_rx) = hub.new_connection();
        hub.register(listener);

        let (handle, peer) = connect(&hub);
        eventually(|| hub.stats().active_connections == 2).await;

        let text = "  {\"a\":1,\n \"b\":2}  ";
        peer.send(Frame::Text(text.to_string()));
        assert_eq!(listener_rx.recv().await.unwrap(), Bytes::from(text));

        peer.send(Frame::Text("   ".to_string()));
        assert_eq!(listener_rx.recv().await.unwrap(), Bytes::from_static(b"   "));

        let binary = Bytes::from_static(&[0x00, b'\n', 0xff]);
        peer.send(Frame::Binary(binary.clone()));
        assert_eq!(listener_rx.recv().await.unwrap(), binary);

        hub.unregister(handle.session_id());
        handle.join().await;
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversize_frame_closes_connection() {
        let (hub, _broker) = running_hub(test_config()).await;
        let (handle, mut peer) = connect(&hub);
        eventually(|| hub.stats().active_connections == 1).await;

        peer.send(Frame::Text("x".repeat(513)));

        assert_eq!(peer.until_close().await, vec![Frame::Close]);
        handle.join().await;
        eventually(|| hub.stats().active_connections == 0).await;
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_at_limit_is_accepted() {
        let (hub, _broker) = running_hub(test_config()).await;
        let (handle, mut peer) = connect(&hub);
        eventually(|| hub.stats().active_connections == 1).await;

        let text = "y".repeat(512);
        peer.send(Frame::Text(text.clone()));
        assert_eq!(peer.from_server.next().await.unwrap(), Frame::Text(text));

        hub.unregister(handle.session_id());
        handle.join().await;
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_closes_idle_connection() {
        let (hub, _broker) = running_hub(test_config()).await;
        let started = Instant::now();
        let (handle, mut peer) = connect(&hub);

        let frames = peer.until_close().await;
        // One keepalive ping at 54s, then the 60s deadline
        assert_eq!(frames, vec![Frame::Ping(Bytes::new()), Frame::Close]);
        assert!(started.elapsed() >= Duration::from_secs(60));

        handle.join().await;
        eventually(|| hub.stats().active_connections == 0).await;
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_refreshes_read_deadline() {
        let (hub, _broker) = running_hub(test_config()).await;
        let started = Instant::now();
        let (handle, mut peer) = connect(&hub);

        tokio::time::sleep(Duration::from_secs(50)).await;
        peer.send(Frame::Pong(Bytes::new()));

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(hub.stats().active_connections, 1);

        assert_eq!(peer.until_close().await.last(), Some(&Frame::Close));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(110) && elapsed < Duration::from_secs(111));

        handle.join().await;
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_unregisters() {
        let (hub, broker) = running_hub(test_config()).await;
        let (handle, mut peer) = connect(&hub);
        let key = handle.session_id().directory_key();
        eventually(|| broker.get(&key).is_some()).await;

        peer.send(Frame::Close);

        assert_eq!(peer.until_close().await, vec![Frame::Close]);
        handle.join().await;
        eventually(|| broker.get(&key).is_none()).await;
        assert_eq!(hub.stats().active_connections, 0);
        hub.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_stop_sends_close() {
        let (hub, _broker) = running_hub(test_config()).await;
        let (handle, mut peer) = connect(&hub);
        eventually(|| hub.stats().active_connections == 1).await;

        assert!(hub.send_to(handle.session_id(), "bye soon"));
        assert_eq!(peer.from_server.next().await.unwrap(), Frame::Text("bye soon".to_string()));

        hub.stop().await;
        assert_eq!(peer.until_close().await, vec![Frame::Close]);
        handle.join().await;
    }
}
