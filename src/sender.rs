//! Outbound event dispatch.
//!
//! One builder per outbound event kind, all funneling through a single write
//! path. Outbound events are fire-and-forget: if the connection is not
//! writable the event is dropped with a warning, never queued or retried.

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::protocol::{
    AudioAction, MessageBatch, OutboundEvent, encode_event, now_millis,
};

/// Write half of the client WebSocket, shared with the transport's tasks.
pub type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

#[derive(Clone)]
struct WritableConn {
    sink: SharedSink,
    open: Arc<AtomicBool>,
}

/// Builds and dispatches outbound events over the active connection.
///
/// Cloneable; the transport repoints every clone at once via
/// [`EventSender::set_connection`] after a (re)connect.
#[derive(Clone, Default)]
pub struct EventSender {
    conn: Arc<Mutex<Option<WritableConn>>>,
}

impl EventSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repoint the sender at a freshly opened connection.
    pub fn set_connection(&self, sink: SharedSink, open: Arc<AtomicBool>) {
        if let Ok(mut guard) = self.conn.lock() {
            *guard = Some(WritableConn { sink, open });
        }
    }

    /// Detach from the current connection; subsequent sends are dropped.
    pub fn clear_connection(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            *guard = None;
        }
    }

    /// The single write path. Stamps `timestamp = now()` unless the caller
    /// supplied one.
    pub async fn send_event(&self, event: OutboundEvent, timestamp: Option<u64>) {
        let conn = match self.conn.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(conn) = conn else {
            warn!(kind = event.kind(), "dropping outbound event: no connection");
            return;
        };
        if !conn.open.load(Ordering::SeqCst) {
            warn!(
                kind = event.kind(),
                "dropping outbound event: connection not writable"
            );
            return;
        }
        let text = match encode_event(&event, timestamp.unwrap_or_else(now_millis)) {
            Ok(text) => text,
            Err(err) => {
                warn!(kind = event.kind(), error = %err, "dropping unencodable event");
                return;
            }
        };
        if let Err(err) = conn.sink.lock().await.send(Message::Text(text.into())).await {
            warn!(kind = event.kind(), error = %err, "outbound send failed");
        }
    }

    /// Submit a message batch for a new turn.
    pub async fn send_message_batch(&self, batch: &MessageBatch) {
        self.send_event(
            OutboundEvent::Message {
                id: batch.id.clone(),
                messages: batch.messages.clone(),
                trigger: batch.trigger,
                message_id: batch.message_id.clone(),
            },
            None,
        )
        .await;
    }

    /// Flush a frontend-executed tool result to the backend.
    pub async fn send_tool_result(&self, tool_call_id: String, result: Value) {
        self.send_event(
            OutboundEvent::ToolResult {
                tool_call_id,
                result,
            },
            None,
        )
        .await;
    }

    pub async fn send_audio_control(&self, action: AudioAction) {
        self.send_event(OutboundEvent::AudioControl { action }, None).await;
    }

    /// Push one base64 chunk of microphone PCM onto the audio sub-stream.
    pub async fn send_audio_chunk(
        &self,
        chunk: String,
        sample_rate: Option<u32>,
        channels: Option<u16>,
        bit_depth: Option<u16>,
    ) {
        self.send_event(
            OutboundEvent::AudioChunk {
                chunk,
                sample_rate,
                channels,
                bit_depth,
            },
            None,
        )
        .await;
    }

    pub async fn send_interrupt(&self, reason: Option<String>) {
        self.send_event(OutboundEvent::Interrupt { reason }, None).await;
    }

    /// Latency probe ping; the payload timestamp doubles as the envelope
    /// timestamp.
    pub async fn send_ping(&self, timestamp: u64) {
        self.send_event(OutboundEvent::Ping { timestamp }, Some(timestamp))
            .await;
    }
}
