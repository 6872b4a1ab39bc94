//! The per-turn event receiver and its stream controller.
//!
//! A fresh [`TurnReceiver`] is installed for every turn. It drives the turn's
//! [`TurnController`] from decoded frames, owns the PCM accumulation pipeline,
//! and owns the turn-termination state machine: at most one close per turn,
//! with the approval/finish-step hold-open pattern kept visibly distinct from
//! the connection-level `[DONE]` close.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::audio::{AudioSink, PcmFormat, decode_pcm_base64, synthesize_wav_data_uri};
use crate::error::StreamError;
use crate::protocol::{Decoded, InboundChunk, PcmPayload, decode_frame};

/// What a turn's chunk stream yields.
pub type StreamItem = Result<InboundChunk, StreamError>;

/// Callback invoked with the timestamp carried by an inbound pong.
pub type PongHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Write side of a turn's chunk stream.
///
/// Closing is idempotent; enqueue attempts after close are logged and
/// dropped, never re-thrown — races between the `[DONE]` path and in-flight
/// message delivery are expected.
pub struct TurnController {
    tx: Option<mpsc::UnboundedSender<StreamItem>>,
}

impl TurnController {
    /// Create a controller and the receiver half its consumer will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Push one chunk to the consumer.
    pub fn enqueue(&mut self, chunk: InboundChunk) {
        match &self.tx {
            Some(tx) => {
                if tx.send(Ok(chunk)).is_err() {
                    debug!("chunk dropped: stream consumer is gone");
                }
            }
            None => warn!("enqueue against a closed turn stream"),
        }
    }

    /// Report a fatal turn error and close. No-op if already closed.
    pub fn error(&mut self, err: StreamError) {
        match self.tx.take() {
            Some(tx) => {
                if tx.send(Err(err)).is_err() {
                    debug!("turn error dropped: stream consumer is gone");
                }
            }
            None => debug!("error after close swallowed: {err}"),
        }
    }

    /// Close the stream. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Per-turn mutable receiver state.
pub struct TurnReceiver {
    done_received: bool,
    awaiting_finish_after_approval: bool,
    pcm_buffer: Vec<i16>,
    pcm_format: Option<PcmFormat>,
    audio_chunk_index: u64,
    audio_sink: Option<Arc<dyn AudioSink>>,
    on_pong: Option<PongHook>,
}

impl TurnReceiver {
    pub fn new(audio_sink: Option<Arc<dyn AudioSink>>, on_pong: Option<PongHook>) -> Self {
        Self {
            done_received: false,
            awaiting_finish_after_approval: false,
            pcm_buffer: Vec::new(),
            pcm_format: None,
            audio_chunk_index: 0,
            audio_sink,
            on_pong,
        }
    }

    /// Whether this turn already saw its terminal; the transport must
    /// allocate a fresh turn rather than reuse this one.
    pub fn done_received(&self) -> bool {
        self.done_received
    }

    /// Number of PCM chunks accepted so far this turn.
    pub fn audio_chunk_index(&self) -> u64 {
        self.audio_chunk_index
    }

    /// Process one raw inbound frame against this turn's controller.
    pub fn handle_frame(&mut self, raw: &str, ctrl: &mut TurnController) {
        match decode_frame(raw) {
            Err(err) => {
                warn!(error = %err, "protocol frame rejected; failing the turn");
                ctrl.error(StreamError::from(err));
            }
            Ok(Decoded::Ignored) => {}
            Ok(Decoded::Pong { timestamp }) => {
                if let Some(hook) = &self.on_pong {
                    hook(timestamp);
                }
            }
            Ok(Decoded::Done) => self.handle_done(ctrl),
            Ok(Decoded::Chunk(chunk)) => self.handle_chunk(chunk, ctrl),
        }
    }

    fn handle_done(&mut self, ctrl: &mut TurnController) {
        if self.done_received {
            warn!("protocol violation: duplicate [DONE] marker ignored");
            return;
        }
        self.done_received = true;
        if let Some(sink) = &self.audio_sink {
            sink.reset();
        }
        ctrl.close();
        self.clear_audio();
    }

    fn handle_chunk(&mut self, chunk: InboundChunk, ctrl: &mut TurnController) {
        match chunk {
            // PCM never enters the primary chunk stream.
            InboundChunk::DataPcm { data } => self.handle_pcm(data),

            // The backend does not always close the connection right after an
            // approval request; hold the stream open until finish-step so the
            // consumer keeps treating the turn as streaming.
            InboundChunk::ToolApprovalRequest { .. } => {
                ctrl.enqueue(chunk);
                self.awaiting_finish_after_approval = true;
            }

            InboundChunk::FinishStep if self.awaiting_finish_after_approval => {
                ctrl.enqueue(InboundChunk::FinishStep);
                // Turn-level close only: the connection stays up, but the
                // transport must hand out a fresh turn next time.
                ctrl.close();
                self.done_received = true;
                self.awaiting_finish_after_approval = false;
            }

            InboundChunk::Finish {
                ref message_metadata,
            } => {
                let audio_turn = message_metadata
                    .as_ref()
                    .and_then(|m| m.audio)
                    .unwrap_or(false);
                if audio_turn && !self.pcm_buffer.is_empty() {
                    // Consumers must see the recorded audio attached before
                    // the turn is marked finished.
                    let format = self.pcm_format.unwrap_or_default();
                    match synthesize_wav_data_uri(&self.pcm_buffer, format) {
                        Ok(url) => {
                            ctrl.enqueue(InboundChunk::File {
                                url,
                                media_type: Some("audio/wav".to_string()),
                            });
                            self.clear_audio();
                        }
                        Err(err) => warn!(error = %err, "WAV synthesis failed"),
                    }
                }
                ctrl.enqueue(chunk);
            }

            other => ctrl.enqueue(other),
        }
    }

    fn handle_pcm(&mut self, data: Option<PcmPayload>) {
        let Some(payload) = data else {
            warn!("data-pcm chunk without a payload skipped");
            return;
        };
        let Some(content) = payload.content.as_deref() else {
            warn!("data-pcm chunk without content skipped");
            return;
        };
        match decode_pcm_base64(content) {
            Ok(samples) => {
                if self.pcm_format.is_none() {
                    self.pcm_format = Some(PcmFormat::from_payload(&payload));
                }
                if let Some(sink) = &self.audio_sink {
                    sink.play_pcm(&samples);
                }
                self.pcm_buffer.extend_from_slice(&samples);
                self.audio_chunk_index += 1;
            }
            Err(err) => warn!(error = %err, "invalid PCM chunk skipped"),
        }
    }

    fn clear_audio(&mut self) {
        self.pcm_buffer.clear();
        self.pcm_format = None;
        self.audio_chunk_index = 0;
    }
}
