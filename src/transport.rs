//! Connection/stream manager.
//!
//! Owns the one persistent WebSocket to the agent backend and hands out one
//! chunk stream per turn. The connection is reused across turns and replaced
//! only when found closed at the start of a new `send_messages` call — never
//! silently mid-turn. Cancelling a turn's stream is coarse: it tears down the
//! whole connection, so callers must serialize turns.

use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::AudioSink;
use crate::error::StreamError;
use crate::protocol::{MessageBatch, now_millis};
use crate::receiver::{StreamItem, TurnController, TurnReceiver};
use crate::sender::{EventSender, SharedSink};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Explicit connection lifecycle; transitions happen in the reader task and
/// at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Callback invoked with each measured round-trip time in milliseconds.
pub type LatencyCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Ping/pong bookkeeping. Only the most recent outstanding ping is tracked;
/// a newer ping simply overwrites the timestamp used for RTT computation.
#[derive(Default)]
pub struct LatencyProbe {
    outstanding: Mutex<Option<u64>>,
    last_rtt: Mutex<Option<u64>>,
    callback: Mutex<Option<LatencyCallback>>,
}

impl LatencyProbe {
    pub fn set_callback(&self, callback: LatencyCallback) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = Some(callback);
        }
    }

    /// Record an outbound ping by its timestamp value.
    pub fn record_ping(&self, timestamp: u64) {
        if let Ok(mut guard) = self.outstanding.lock() {
            *guard = Some(timestamp);
        }
    }

    /// Match an inbound pong against the outstanding ping.
    pub fn observe_pong(&self, timestamp: u64) {
        let matched = match self.outstanding.lock() {
            Ok(mut guard) => {
                if *guard == Some(timestamp) {
                    *guard = None;
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        };
        if !matched {
            debug!(timestamp, "pong matched no outstanding ping");
            return;
        }
        let rtt = now_millis().saturating_sub(timestamp);
        if let Ok(mut guard) = self.last_rtt.lock() {
            *guard = Some(rtt);
        }
        let callback = match self.callback.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(rtt);
        }
    }

    /// Last measured round-trip time in milliseconds.
    pub fn last_rtt(&self) -> Option<u64> {
        self.last_rtt.lock().ok().and_then(|g| *g)
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Backend WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
        }
    }
}

struct ActiveTurn {
    receiver: TurnReceiver,
    controller: TurnController,
}

/// The current turn's receiver + controller, read by the connection's reader
/// task. Installing a new turn replaces and detaches the previous one; only
/// one handler is ever active per connection.
type TurnSlot = Arc<tokio::sync::Mutex<Option<ActiveTurn>>>;

struct Connection {
    open: Arc<AtomicBool>,
    state: Arc<Mutex<ConnectionState>>,
    slot: TurnSlot,
    cancel: CancellationToken,
}

impl Connection {
    fn is_usable(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && matches!(
                self.state.lock().map(|s| *s),
                Ok(ConnectionState::Open)
            )
    }
}

/// Lazy chunk stream for one turn.
///
/// Cancellation is deliberately coarse: there is one physical connection, so
/// [`ChunkStream::cancel`] tears down connectivity for all turns.
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    cancel: CancellationToken,
}

impl ChunkStream {
    fn new(rx: mpsc::UnboundedReceiver<StreamItem>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Abort this turn by closing the shared connection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl futures_util::Stream for ChunkStream {
    type Item = StreamItem;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Holds the single persistent connection and the active turn.
pub struct Transport {
    config: TransportConfig,
    sender: EventSender,
    probe: Arc<LatencyProbe>,
    audio_sink: Option<Arc<dyn AudioSink>>,
    conn: Option<Connection>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            sender: EventSender::new(),
            probe: Arc::new(LatencyProbe::default()),
            audio_sink: None,
            conn: None,
        }
    }

    /// Install the live-playback sink future turns will feed.
    pub fn set_audio_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.audio_sink = Some(sink);
    }

    /// Install the latency callback invoked per measured round trip.
    pub fn set_latency_callback(&self, callback: LatencyCallback) {
        self.probe.set_callback(callback);
    }

    /// Last measured round-trip time, if a pong has come back yet.
    pub fn latency(&self) -> Option<u64> {
        self.probe.last_rtt()
    }

    /// Outbound event surface for out-of-band sends (tool results, audio
    /// control/chunks, interrupts).
    pub fn sender(&self) -> &EventSender {
        &self.sender
    }

    /// Interrupt the current turn on the backend side.
    pub async fn interrupt(&self, reason: Option<String>) {
        self.sender.send_interrupt(reason).await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        match &self.conn {
            Some(conn) => conn.state.lock().map(|s| *s).unwrap_or(ConnectionState::Closed),
            None => ConnectionState::Idle,
        }
    }

    /// Start a turn: ensure the connection, install a fresh receiver, send
    /// the batch, and return the turn's chunk stream.
    pub async fn send_messages(&mut self, batch: MessageBatch) -> Result<ChunkStream> {
        self.ensure_connection().await?;
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| anyhow!("connection unavailable after connect"))?;

        let (controller, rx) = TurnController::channel();
        let probe = self.probe.clone();
        let receiver = TurnReceiver::new(
            self.audio_sink.clone(),
            Some(Arc::new(move |ts| probe.observe_pong(ts))),
        );

        {
            let mut slot = conn.slot.lock().await;
            if let Some(mut previous) = slot.take() {
                if !previous.controller.is_closed() {
                    debug!("closing previous turn's stream before starting a new turn");
                    previous.controller.close();
                }
            }
            *slot = Some(ActiveTurn {
                receiver,
                controller,
            });
        }

        self.sender.send_message_batch(&batch).await;
        Ok(ChunkStream::new(rx, conn.cancel.clone()))
    }

    /// Tear down the connection, aborting any in-flight turn.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.cancel.cancel();
        }
        self.sender.clear_connection();
    }

    async fn ensure_connection(&mut self) -> Result<()> {
        if let Some(conn) = &self.conn {
            if conn.is_usable() {
                return Ok(());
            }
        }
        // Replace a closed/closing connection; cancel its tasks first.
        if let Some(stale) = self.conn.take() {
            stale.cancel.cancel();
        }
        self.sender.clear_connection();

        url::Url::parse(&self.config.url)
            .with_context(|| format!("invalid backend url {}", self.config.url))?;

        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let (ws, _response) =
            tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(self.config.url.as_str()),
            )
                .await
                .map_err(|_| {
                    anyhow!(
                        "connect timeout after {:?} to {}",
                        self.config.connect_timeout,
                        self.config.url
                    )
                })?
                .with_context(|| format!("WebSocket handshake with {} failed", self.config.url))?;

        let (sink, reader) = ws.split();
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
        let open = Arc::new(AtomicBool::new(true));
        set_state(&state, ConnectionState::Open);

        let slot: TurnSlot = Arc::new(tokio::sync::Mutex::new(None));
        let cancel = CancellationToken::new();

        self.sender.set_connection(sink.clone(), open.clone());

        tokio::spawn(reader_loop(
            reader,
            sink.clone(),
            slot.clone(),
            open.clone(),
            state.clone(),
            cancel.clone(),
        ));
        tokio::spawn(ping_loop(
            self.sender.clone(),
            self.probe.clone(),
            open.clone(),
            cancel.clone(),
            self.config.ping_interval,
        ));

        self.conn = Some(Connection {
            open,
            state,
            slot,
            cancel,
        });
        Ok(())
    }
}

fn set_state(state: &Arc<Mutex<ConnectionState>>, next: ConnectionState) {
    if let Ok(mut guard) = state.lock() {
        *guard = next;
    }
}

/// Route inbound frames to the current turn until the connection dies or the
/// cancel token fires.
async fn reader_loop(
    mut reader: WsReader,
    sink: SharedSink,
    slot: TurnSlot,
    open: Arc<AtomicBool>,
    state: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                set_state(&state, ConnectionState::Closing);
                {
                    use futures_util::SinkExt;
                    let _ = sink.lock().await.send(Message::Close(None)).await;
                }
                let mut guard = slot.lock().await;
                if let Some(turn) = guard.as_mut() {
                    turn.controller.close();
                }
                break;
            }
            next = reader.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    let mut guard = slot.lock().await;
                    match guard.as_mut() {
                        Some(turn) => {
                            turn.receiver.handle_frame(text.as_str(), &mut turn.controller);
                        }
                        None => debug!("inbound frame with no active turn dropped"),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // WebSocket-level keepalive; the protocol has its own.
                }
                Some(Ok(Message::Close(_))) | None => {
                    let mut guard = slot.lock().await;
                    if let Some(turn) = guard.as_mut() {
                        turn.controller.close();
                    }
                    break;
                }
                Some(Ok(_)) => debug!("ignoring non-text frame"),
                Some(Err(err)) => {
                    warn!(error = %err, "connection error mid-turn");
                    let mut guard = slot.lock().await;
                    if let Some(turn) = guard.as_mut() {
                        turn.controller.error(StreamError::Connection(err.to_string()));
                    }
                    break;
                }
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    set_state(&state, ConnectionState::Closed);
    // Stops the ping loop; a no-op if the teardown started from the token.
    cancel.cancel();
}

/// Fixed-interval latency probe; stops when the connection closes.
async fn ping_loop(
    sender: EventSender,
    probe: Arc<LatencyProbe>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    interval: Duration,
) {
    // The first tick waits a full interval: on a fresh connection the
    // opening message must be the first event on the wire, not a ping.
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !open.load(Ordering::SeqCst) {
                    break;
                }
                let timestamp = now_millis();
                probe.record_ping(timestamp);
                sender.send_ping(timestamp).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_ignores_unmatched_pong() {
        let probe = LatencyProbe::default();
        probe.observe_pong(123);
        assert_eq!(probe.last_rtt(), None);
    }

    #[test]
    fn probe_matches_newest_outstanding_ping() {
        let probe = LatencyProbe::default();
        probe.record_ping(1);
        probe.record_ping(2); // overwrites; ping 1 is forgotten
        probe.observe_pong(1);
        assert_eq!(probe.last_rtt(), None);
        probe.observe_pong(2);
        assert!(probe.last_rtt().is_some());
    }

    #[test]
    fn probe_invokes_callback_once_per_match() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let probe = LatencyProbe::default();
        let counter = count.clone();
        probe.set_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        probe.record_ping(5);
        probe.observe_pong(5);
        probe.observe_pong(5); // no longer outstanding
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_to_unreachable_backend_fails() {
        let mut transport = Transport::new(TransportConfig {
            url: "ws://127.0.0.1:9".to_string(),
            connect_timeout: Duration::from_millis(500),
            ping_interval: Duration::from_secs(15),
        });
        let result = transport
            .send_messages(MessageBatch {
                id: "req".into(),
                messages: vec![],
                trigger: crate::protocol::SubmitTrigger::SubmitMessage,
                message_id: "m1".into(),
            })
            .await;
        assert!(result.is_err());
        assert_eq!(transport.connection_state(), ConnectionState::Idle);
    }

    #[test]
    fn invalid_url_is_rejected() {
        let config = TransportConfig::new("not a url");
        assert!(url::Url::parse(&config.url).is_err());
    }
}
