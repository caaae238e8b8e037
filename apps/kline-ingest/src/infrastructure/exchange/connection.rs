//! Kline Stream Connection
//!
//! One task owns the websocket. Every write (queued requests, pong replies,
//! the close frame) goes through the `select!` loop in [`StreamConnection`],
//! so the transport never needs a lock. Other tasks talk to it through a
//! cloneable [`ConnectionHandle`]: a `watch` state plus a bounded queue.
//!
//! # Session lifecycle
//!
//! 1. `Disconnected -> Connecting`, open the socket with `connect_timeout`
//! 2. `Connecting -> Connected`, drop frames queued for the old session,
//!    reset the backoff and call [`StreamHandler::handle_open`]
//! 3. Receive loop plus the keepalive check until the session fails
//! 4. `Connected -> Disconnected`, back off and start over
//!
//! [`ConnectionHandle::stop`] moves to `Stopped` from anywhere and ends the
//! loop for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::{CodecError, GzipJsonCodec, Inbound};
use super::keepalive::{HealthVerdict, KeepaliveConfig, LivenessState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::state::{ConnectionState, ConnectionStatus, IllegalTransition};
use crate::application::ports::{ExchangeGateway, SendError, StreamHandler};
use crate::domain::protocol::OutboundFrame;
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The socket did not open within the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// A frame could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A write did not complete within the request timeout.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// No keepalive arrived before the alive deadline.
    #[error("keepalive expired {overdue_ms}ms ago")]
    KeepaliveExpired {
        /// Milliseconds past the alive deadline.
        overdue_ms: i64,
    },

    /// The peer closed the socket.
    #[error("connection closed")]
    ConnectionClosed,

    /// A state change was rejected.
    #[error(transparent)]
    IllegalState(#[from] IllegalTransition),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL.
    pub url: String,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Timeout for writing one frame.
    pub write_timeout: Duration,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Keepalive configuration.
    pub keepalive: KeepaliveConfig,
}

impl StreamConfig {
    /// Create a configuration with default timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            outbound_capacity: 256,
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }

    /// Build from the stream settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: settings.connect_timeout,
            write_timeout: settings.request_timeout,
            outbound_capacity: settings.outbound_capacity,
            reconnect: ReconnectConfig::from_settings(settings),
            keepalive: KeepaliveConfig::from_settings(settings),
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Counters shared between the connection task and observers.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    sessions: AtomicU64,
    reconnects: AtomicU64,
    messages: AtomicU64,
    frames_sent: AtomicU64,
}

impl ConnectionStats {
    /// Sessions opened so far.
    #[must_use]
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Sessions opened after the first one.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Non-keepalive messages dispatched to the handler.
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Queued frames written to the socket.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable send side of the connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    status: ConnectionStatus,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandle {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.current()
    }

    /// Observable connection status.
    #[must_use]
    pub const fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Connection counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl ExchangeGateway for ConnectionHandle {
    fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        match self.status.current() {
            ConnectionState::Connected => {}
            ConnectionState::Stopped => return Err(SendError::Stopped),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(SendError::NotConnected);
            }
        }

        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Stopped,
        })
    }

    fn is_connected(&self) -> bool {
        self.status.current() == ConnectionState::Connected
    }

    async fn wait_connected(&self) -> bool {
        self.status.wait_connected().await
    }

    fn stop(&self) {
        if self.status.stop() {
            tracing::info!("Stopping kline stream connection");
            metrics::set_connection_state(ConnectionState::Stopped);
        }
        self.cancel.cancel();
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Owner of the websocket and its reconnect loop.
pub struct StreamConnection {
    config: StreamConfig,
    codec: GzipJsonCodec,
    status: ConnectionStatus,
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
    stats: Arc<ConnectionStats>,
}

impl StreamConnection {
    /// Create a connection and its handle.
    ///
    /// The connection stops when `shutdown` is cancelled or the handle's
    /// `stop` is called.
    #[must_use]
    pub fn new(config: StreamConfig, shutdown: &CancellationToken) -> (Self, ConnectionHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let status = ConnectionStatus::new();
        let cancel = shutdown.child_token();
        let stats = Arc::new(ConnectionStats::default());

        let handle = ConnectionHandle {
            status: status.clone(),
            outbound: outbound_tx,
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
        };
        let connection = Self {
            config,
            codec: GzipJsonCodec::new(),
            status,
            outbound_rx,
            cancel,
            stats,
        };
        (connection, handle)
    }

    /// Run sessions until stopped.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::MaxReconnectAttemptsExceeded`] when a configured
    /// attempt limit runs out. The connection is `Stopped` afterwards either way.
    pub async fn run<H>(mut self, handler: Arc<H>) -> Result<(), StreamError>
    where
        H: StreamHandler + ?Sized,
    {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let mut opened_before = false;

        loop {
            if self.cancel.is_cancelled() || self.status.current().is_terminal() {
                self.finish();
                return Ok(());
            }

            match self
                .run_session(handler.as_ref(), &mut policy, &mut opened_before)
                .await
            {
                Ok(()) => {
                    self.finish();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Kline stream session ended");
                    if self.status.transition(ConnectionState::Disconnected).is_ok() {
                        metrics::set_connection_state(ConnectionState::Disconnected);
                    }

                    let Some(delay) = policy.next_delay() else {
                        self.finish();
                        return Err(StreamError::MaxReconnectAttemptsExceeded);
                    };
                    tracing::info!(
                        attempt = policy.attempt_count(),
                        delay_ms = delay.as_millis(),
                        "Reconnecting to kline stream"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Kline stream cancelled during reconnect delay");
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn finish(&self) {
        if self.status.stop() {
            metrics::set_connection_state(ConnectionState::Stopped);
        }
        tracing::info!(
            sessions = self.stats.sessions(),
            reconnects = self.stats.reconnects(),
            "Kline stream connection stopped"
        );
    }

    /// Open one session and drive it until it fails or is cancelled.
    async fn run_session<H>(
        &mut self,
        handler: &H,
        policy: &mut ReconnectPolicy,
        opened_before: &mut bool,
    ) -> Result<(), StreamError>
    where
        H: StreamHandler + ?Sized,
    {
        if self.status.current().is_terminal() {
            return Ok(());
        }
        self.status.transition(ConnectionState::Connecting)?;
        metrics::set_connection_state(ConnectionState::Connecting);

        let session = Uuid::new_v4();
        tracing::info!(%session, url = %self.config.url, "Connecting to kline stream");

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = connect => result
                .map_err(|_| StreamError::ConnectTimeout(self.config.connect_timeout))??,
        };
        let (mut write, mut read) = ws_stream.split();

        let discarded = self.discard_queued();
        if discarded > 0 {
            tracing::debug!(%session, discarded, "Dropped frames queued for the previous session");
        }

        self.status.transition(ConnectionState::Connected)?;
        metrics::set_connection_state(ConnectionState::Connected);
        policy.reset();
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        let reconnect = *opened_before;
        if reconnect {
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();
        }
        *opened_before = true;
        tracing::info!(%session, reconnect, "Kline stream connected");

        handler.handle_open(reconnect).await;

        let keepalive = self.config.keepalive.clone();
        let check_interval = keepalive.check_interval;
        let mut liveness = LivenessState::new(keepalive, now_ms());
        let mut health = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!(%session, "Closing kline stream session");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = health.tick() => {
                    match liveness.evaluate(now_ms()) {
                        HealthVerdict::Healthy => {}
                        HealthVerdict::Stale { silent_ms } => {
                            tracing::debug!(%session, silent_ms, "Kline stream is stale");
                            handler.handle_stale().await;
                        }
                        HealthVerdict::Dead { overdue_ms } => {
                            tracing::warn!(%session, overdue_ms, "Kline stream keepalive expired");
                            let _ = write.send(Message::Close(None)).await;
                            return Err(StreamError::KeepaliveExpired { overdue_ms });
                        }
                    }
                }
                Some(frame) = self.outbound_rx.recv() => {
                    self.send_frame(&mut write, &frame, handler).await?;
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    metrics::record_request_sent();
                }
                msg = read.next() => {
                    let inbound = match msg {
                        Some(Ok(Message::Binary(bytes))) => self.codec.decode_binary(&bytes)?,
                        Some(Ok(Message::Text(text))) => self.codec.decode_text(text.as_str())?,
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(%session, "Server sent close frame");
                            return Err(StreamError::ConnectionClosed);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!(%session, "WebSocket stream ended");
                            return Err(StreamError::ConnectionClosed);
                        }
                    };
                    self.on_inbound(inbound, handler, &mut write, &mut liveness).await?;
                }
            }
        }
    }

    async fn on_inbound<H, W>(
        &self,
        inbound: Inbound,
        handler: &H,
        write: &mut W,
        liveness: &mut LivenessState,
    ) -> Result<(), StreamError>
    where
        H: StreamHandler + ?Sized,
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match inbound {
            Inbound::Ping(ts) => {
                liveness.record_ping(ts);
                self.send_frame(write, &OutboundFrame::pong(ts), handler).await
            }
            Inbound::Message(envelope) => {
                liveness.record_update(now_ms());
                self.stats.messages.fetch_add(1, Ordering::Relaxed);
                metrics::record_frame_received(envelope.kind());
                handler.handle_message(envelope).await;
                Ok(())
            }
        }
    }

    /// Write one frame. A failed write is reported to the handler and ends
    /// the session.
    async fn send_frame<H, W>(
        &self,
        write: &mut W,
        frame: &OutboundFrame,
        handler: &H,
    ) -> Result<(), StreamError>
    where
        H: StreamHandler + ?Sized,
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let result = write_frame(write, frame, self.config.write_timeout).await;
        if let Err(e) = &result {
            metrics::record_send_failure();
            handler.handle_send_failure(frame, &e.to_string()).await;
        }
        result
    }

    fn discard_queued(&mut self) -> usize {
        let mut discarded = 0;
        while self.outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

async fn write_frame<W>(
    write: &mut W,
    frame: &OutboundFrame,
    timeout: Duration,
) -> Result<(), StreamError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let send = write.send(Message::Text(frame.text.clone().into()));
    match tokio::time::timeout(timeout, send).await {
        Ok(result) => result.map_err(StreamError::from),
        Err(_) => Err(StreamError::WriteTimeout(timeout)),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::protocol::Envelope;
    use parking_lot::Mutex;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink whose peer is gone.
    struct ClosedSink;

    impl Sink<Message> for ClosedSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Err(tungstenite::Error::ConnectionClosed))
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Err(tungstenite::Error::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Default)]
    struct FailureLog {
        frames: Mutex<Vec<OutboundFrame>>,
    }

    #[async_trait]
    impl StreamHandler for FailureLog {
        async fn handle_open(&self, _reconnect: bool) {}

        async fn handle_message(&self, _envelope: Envelope) {}

        async fn handle_stale(&self) {}

        async fn handle_send_failure(&self, frame: &OutboundFrame, _error: &str) {
            self.frames.lock().push(frame.clone());
        }
    }

    fn handle() -> (StreamConnection, ConnectionHandle) {
        let mut config = StreamConfig::new("ws://127.0.0.1:9");
        config.outbound_capacity = 1;
        StreamConnection::new(config, &CancellationToken::new())
    }

    #[test]
    fn send_requires_connected_state() {
        let (_connection, handle) = handle();
        assert_eq!(
            handle.send(OutboundFrame::pong(1)),
            Err(SendError::NotConnected)
        );
        assert!(!handle.is_connected());
    }

    #[test]
    fn send_reports_full_queue() {
        let (_connection, handle) = handle();
        handle.status.transition(ConnectionState::Connecting).unwrap();
        handle.status.transition(ConnectionState::Connected).unwrap();

        assert_eq!(handle.send(OutboundFrame::pong(1)), Ok(()));
        assert_eq!(
            handle.send(OutboundFrame::pong(2)),
            Err(SendError::QueueFull)
        );
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let (connection, handle) = handle();
        handle.stop();
        handle.stop();
        assert_eq!(handle.state(), ConnectionState::Stopped);
        assert!(connection.cancel.is_cancelled());
        assert_eq!(handle.send(OutboundFrame::pong(1)), Err(SendError::Stopped));
    }

    #[test]
    fn parent_shutdown_cancels_connection() {
        let shutdown = CancellationToken::new();
        let (connection, _handle) =
            StreamConnection::new(StreamConfig::new("ws://127.0.0.1:9"), &shutdown);
        shutdown.cancel();
        assert!(connection.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn failed_pong_is_reported_like_any_write() {
        let (connection, _handle) = handle();
        let handler = FailureLog::default();
        let mut liveness = LivenessState::new(connection.config.keepalive.clone(), now_ms());

        let result = connection
            .on_inbound(Inbound::Ping(1_700_000_000_000), &handler, &mut ClosedSink, &mut liveness)
            .await;

        assert!(matches!(result, Err(StreamError::WebSocket(_))));
        assert_eq!(*handler.frames.lock(), vec![OutboundFrame::pong(1_700_000_000_000)]);
    }

    #[tokio::test]
    async fn failed_queued_frame_is_reported() {
        let (connection, _handle) = handle();
        let handler = FailureLog::default();
        let frame = OutboundFrame::pong(7);

        let result = connection.send_frame(&mut ClosedSink, &frame, &handler).await;

        assert!(result.is_err());
        assert_eq!(*handler.frames.lock(), vec![frame]);
    }

    #[test]
    fn new_session_discards_stale_frames() {
        let (mut connection, handle) = handle();
        handle.status.transition(ConnectionState::Connecting).unwrap();
        handle.status.transition(ConnectionState::Connected).unwrap();
        handle.send(OutboundFrame::pong(1)).unwrap();
        assert_eq!(connection.discard_queued(), 1);
        assert_eq!(connection.discard_queued(), 0);
    }
}
