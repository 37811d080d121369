//! One live WebSocket: a bounded outbound queue drained by a writer task that
//! also keeps the heartbeat, and a reader the protocol handlers pull frames from.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use relay_core::{ConnectionId, RelayError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cloneable sending side of a connection. This is what the presence state
/// holds on to; it never touches the socket directly.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(queue: usize, closer: CancellationToken) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue);
        (
            Self {
                id: ConnectionId::new(),
                tx,
                closer,
            },
            rx,
        )
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Best-effort enqueue. A full or closed queue drops the frame.
    pub fn send(&self, frame: String) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the server side to close this connection.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// Ping cadence and how long a peer may stay silent past a ping.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Last ping sent and last pong seen, in ms since connection start.
struct Liveness {
    started: Instant,
    last_ping_ms: AtomicU64,
    last_pong_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ping_ms: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn record_ping(&self) {
        self.last_ping_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn record_pong(&self) {
        self.last_pong_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// When the unanswered ping went out, if there is one.
    fn outstanding_since(&self) -> Option<Instant> {
        let ping = self.last_ping_ms.load(Ordering::Relaxed);
        let pong = self.last_pong_ms.load(Ordering::Relaxed);
        (ping > pong).then(|| self.started + Duration::from_millis(ping))
    }

    /// True once a ping has gone `timeout` without a pong.
    fn expired(&self, now: Instant, heartbeat: Heartbeat) -> bool {
        self.outstanding_since()
            .is_some_and(|sent| now.saturating_duration_since(sent) >= heartbeat.timeout)
    }
}

/// Server side of one socket.
pub struct Connection {
    handle: ConnectionHandle,
    reader: SplitStream<WebSocket>,
    writer: JoinHandle<()>,
    liveness: Arc<Liveness>,
}

impl Connection {
    /// Split the socket and spawn the writer task.
    pub fn start(
        socket: WebSocket,
        handle: ConnectionHandle,
        mut rx: mpsc::Receiver<String>,
        heartbeat: Heartbeat,
    ) -> Self {
        let (mut ws_tx, reader) = socket.split();
        let liveness = Arc::new(Liveness::new());

        let writer_liveness = Arc::clone(&liveness);
        let closer = handle.closer.clone();
        let id = handle.id.clone();
        let writer = tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(heartbeat.interval);
            ping_interval.tick().await; // consume first immediate tick
            let pong_deadline = tokio::time::sleep(heartbeat.timeout);
            tokio::pin!(pong_deadline);
            let mut awaiting_pong = false;

            loop {
                tokio::select! {
                    _ = closer.cancelled() => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(text) => {
                                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = &mut pong_deadline, if awaiting_pong => {
                        awaiting_pong = false;
                        if writer_liveness.expired(Instant::now(), heartbeat) {
                            tracing::warn!(connection_id = %id, "heartbeat timeout");
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        // One ping in flight at a time; its deadline is not pushed back.
                        if writer_liveness.outstanding_since().is_some() {
                            continue;
                        }
                        if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                        writer_liveness.record_ping();
                        pong_deadline.as_mut().reset(Instant::now() + heartbeat.timeout);
                        awaiting_pong = true;
                        tracing::trace!(connection_id = %id, "sent ping");
                    }
                }
            }

            // Wake the reader if the writer stopped first.
            closer.cancel();
        });

        Self {
            handle,
            reader,
            writer,
            liveness,
        }
    }

    /// Next inbound text frame. `Ok(None)` means the connection is over;
    /// binary frames are a protocol violation.
    pub async fn next_text(&mut self) -> Result<Option<String>, RelayError> {
        loop {
            let msg = tokio::select! {
                _ = self.handle.closer.cancelled() => return Ok(None),
                msg = self.reader.next() => msg,
            };

            match msg {
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(WsMessage::Binary(_))) => {
                    return Err(RelayError::ProtocolViolation("binary frame".into()))
                }
                Some(Ok(WsMessage::Pong(_))) => self.liveness.record_pong(),
                Some(Ok(WsMessage::Ping(_))) => {} // axum answers pings itself
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return Ok(None),
            }
        }
    }

    /// Stop the writer and wait for it to flush its close frame.
    pub async fn finish(self) {
        self.handle.close();
        let _ = self.writer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(15),
        }
    }

    #[test]
    fn handle_ids_unique() {
        let (a, _ra) = ConnectionHandle::new(4, CancellationToken::new());
        let (b, _rb) = ConnectionHandle::new(4, CancellationToken::new());
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("conn_"));
    }

    #[test]
    fn send_enqueues() {
        let (handle, mut rx) = ConnectionHandle::new(4, CancellationToken::new());
        assert!(handle.send("hello".into()));
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn send_to_full_queue_drops() {
        let (handle, _rx) = ConnectionHandle::new(2, CancellationToken::new());
        assert!(handle.send("1".into()));
        assert!(handle.send("2".into()));
        assert!(!handle.send("3".into()));
    }

    #[test]
    fn send_after_receiver_dropped_fails() {
        let (handle, rx) = ConnectionHandle::new(2, CancellationToken::new());
        drop(rx);
        assert!(!handle.send("x".into()));
    }

    #[test]
    fn close_is_shared_by_clones() {
        let (handle, _rx) = ConnectionHandle::new(2, CancellationToken::new());
        let clone = handle.clone();
        assert!(!clone.is_closed());
        handle.close();
        assert!(clone.is_closed());
    }

    #[test]
    fn parent_cancellation_closes_children() {
        let shutdown = CancellationToken::new();
        let (handle, _rx) = ConnectionHandle::new(2, shutdown.child_token());
        shutdown.cancel();
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connection_is_not_expired() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(liveness.outstanding_since().is_none());
        assert!(!liveness.expired(Instant::now(), heartbeat()));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_expires_after_timeout() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(15)).await;
        liveness.record_ping();

        tokio::time::advance(Duration::from_millis(14_900)).await;
        assert!(!liveness.expired(Instant::now(), heartbeat()));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(liveness.expired(Instant::now(), heartbeat()));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_ping_then_silence_expires_on_next_ping() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(15)).await;
        liveness.record_ping();
        tokio::time::advance(Duration::from_millis(100)).await;
        liveness.record_pong();
        assert!(liveness.outstanding_since().is_none());

        // Next ping at 30 s goes unanswered; 15 s later the peer is gone.
        tokio::time::advance(Duration::from_millis(14_900)).await;
        liveness.record_ping();
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(liveness.expired(Instant::now(), heartbeat()));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_clears_outstanding_ping() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(15)).await;
        liveness.record_ping();
        tokio::time::advance(Duration::from_secs(14)).await;
        liveness.record_pong();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!liveness.expired(Instant::now(), heartbeat()));
    }
}
