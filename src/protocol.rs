//! Wire protocol types and the frame codec.
//!
//! The backend speaks a request/response-oriented sub-protocol over one
//! persistent WebSocket: outbound events are single JSON objects tagged by
//! `type`, inbound frames reuse SSE framing (`data: <json>`, terminated by
//! `data: [DONE]`) with bare JSON pong messages outside the protocol.
//!
//! Every shape is a closed tagged union; dispatch is by tag, never by ad hoc
//! field probing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::ProtocolError;

/// SSE-style prefix carried by every protocol frame.
pub const SSE_DATA_PREFIX: &str = "data: ";

/// Terminal sentinel closing a turn's primary event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Version stamped into every outbound envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Outbound events ─────────────────────────────────────────────────────────

/// What triggered a message submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitTrigger {
    #[serde(rename = "submit-message")]
    SubmitMessage,
    #[serde(rename = "regenerate-message")]
    RegenerateMessage,
}

/// Start/stop control for the outbound audio sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioAction {
    Start,
    Stop,
}

/// One batch of messages submitted for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBatch {
    pub id: String,
    pub messages: Vec<UiMessage>,
    pub trigger: SubmitTrigger,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

/// The six outbound event kinds. Serialized with a `type` tag; the envelope
/// additionally carries `version` and `timestamp` (see [`encode_event`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Message {
        id: String,
        messages: Vec<UiMessage>,
        trigger: SubmitTrigger,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        result: Value,
    },
    AudioControl {
        action: AudioAction,
    },
    AudioChunk {
        /// Base64-encoded little-endian 16-bit samples.
        chunk: String,
        #[serde(rename = "sampleRate", skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channels: Option<u16>,
        #[serde(rename = "bitDepth", skip_serializing_if = "Option::is_none")]
        bit_depth: Option<u16>,
    },
    Interrupt {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
}

impl OutboundEvent {
    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Message { .. } => "message",
            OutboundEvent::ToolResult { .. } => "tool_result",
            OutboundEvent::AudioControl { .. } => "audio_control",
            OutboundEvent::AudioChunk { .. } => "audio_chunk",
            OutboundEvent::Interrupt { .. } => "interrupt",
            OutboundEvent::Ping { .. } => "ping",
        }
    }
}

/// Serialize an outbound event into its wire envelope.
///
/// Adds `version` and, unless the event already carries one (ping does),
/// stamps `timestamp`.
pub fn encode_event(event: &OutboundEvent, timestamp: u64) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(event).map_err(|e| ProtocolError::Encode {
        detail: e.to_string(),
    })?;
    let obj = value.as_object_mut().ok_or_else(|| ProtocolError::Encode {
        detail: "event did not serialize to an object".to_string(),
    })?;
    obj.insert("version".to_string(), Value::from(PROTOCOL_VERSION));
    obj.entry("timestamp").or_insert_with(|| Value::from(timestamp));
    serde_json::to_string(&value).map_err(|e| ProtocolError::Encode {
        detail: e.to_string(),
    })
}

// ── Inbound chunks ──────────────────────────────────────────────────────────

/// Payload of a `data-pcm` chunk. All fields are lenient so the receiver can
/// warn and skip invalid PCM without failing the turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PcmPayload {
    /// Base64-encoded little-endian 16-bit samples.
    pub content: Option<String>,
    #[serde(rename = "sampleRate")]
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    #[serde(rename = "bitDepth")]
    pub bit_depth: Option<u16>,
}

/// Metadata attached to a `finish` chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinishMetadata {
    /// Set when the turn produced audio; triggers WAV synthesis from the
    /// buffered PCM.
    pub audio: Option<bool>,
    pub usage: Option<Value>,
}

/// One typed unit of the produced chunk sequence, mirroring the UI chunk
/// protocol. Unknown `type` tags land in [`InboundChunk::Other`] and are
/// forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundChunk {
    #[serde(rename = "text-start")]
    TextStart { id: Option<String> },
    #[serde(rename = "text-delta")]
    TextDelta { id: Option<String>, delta: String },
    #[serde(rename = "text-end")]
    TextEnd { id: Option<String> },
    #[serde(rename = "tool-input-start")]
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: Option<String>,
    },
    #[serde(rename = "tool-input-available")]
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: Option<String>,
        input: Option<Value>,
    },
    #[serde(rename = "tool-approval-request")]
    ToolApprovalRequest {
        #[serde(rename = "approvalId")]
        approval_id: Option<String>,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },
    #[serde(rename = "tool-output-available")]
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Option<Value>,
    },
    #[serde(rename = "tool-output-denied")]
    ToolOutputDenied {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },
    #[serde(rename = "finish")]
    Finish {
        #[serde(rename = "messageMetadata")]
        message_metadata: Option<FinishMetadata>,
    },
    #[serde(rename = "finish-step")]
    FinishStep,
    #[serde(rename = "data-pcm")]
    DataPcm { data: Option<PcmPayload> },
    #[serde(rename = "file")]
    File {
        url: String,
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "errorText")]
        error_text: Option<String>,
    },
    /// Any chunk type this client does not interpret; passed through as-is.
    #[serde(skip)]
    Other(Value),
}

/// Result of decoding one raw inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A protocol chunk for the turn's stream.
    Chunk(InboundChunk),
    /// The `[DONE]` terminal marker.
    Done,
    /// A non-protocol pong message carrying the original ping timestamp.
    Pong { timestamp: u64 },
    /// A non-protocol message this client discards.
    Ignored,
}

/// Parse one raw inbound text frame.
///
/// Frames without the `data: ` prefix are non-protocol messages: a pong is
/// surfaced, anything else is logged and discarded — never fatal. Frames with
/// the prefix are protocol frames: a malformed body is a hard error because
/// it indicates message loss.
pub fn decode_frame(raw: &str) -> Result<Decoded, ProtocolError> {
    let Some(body) = raw.strip_prefix(SSE_DATA_PREFIX) else {
        return Ok(decode_nonprotocol(raw));
    };
    let body = body.trim();
    if body == DONE_SENTINEL {
        return Ok(Decoded::Done);
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| ProtocolError::MalformedFrame {
            detail: e.to_string(),
        })?;
    if value.get("type").and_then(Value::as_str).is_none() {
        return Err(ProtocolError::UntaggedFrame);
    }
    match serde_json::from_value::<InboundChunk>(value.clone()) {
        Ok(chunk) => Ok(Decoded::Chunk(chunk)),
        Err(err) => {
            // Known-looking tag with an unexpected payload shape, or a tag we
            // don't interpret: forward unchanged rather than failing the turn.
            debug!(error = %err, "passing through unrecognized chunk shape");
            Ok(Decoded::Chunk(InboundChunk::Other(value)))
        }
    }
}

fn decode_nonprotocol(raw: &str) -> Decoded {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.get("type").and_then(Value::as_str) == Some("pong") => {
            match value.get("timestamp").and_then(Value::as_u64) {
                Some(timestamp) => Decoded::Pong { timestamp },
                None => {
                    debug!("discarding pong without a timestamp");
                    Decoded::Ignored
                }
            }
        }
        Ok(_) => {
            debug!("discarding non-protocol message");
            Decoded::Ignored
        }
        Err(_) => {
            debug!("discarding non-JSON message");
            Decoded::Ignored
        }
    }
}

// ── Caller-owned message history ────────────────────────────────────────────

/// Role of a message in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle of a tool part, covering both plain tools and the
/// confirmation-style approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    ApprovalRequested,
    ApprovalResponded { approved: bool },
    OutputAvailable,
    OutputError,
}

impl ToolState {
    /// Output-available or output-error: the backend (or caller) has settled
    /// this tool call.
    pub fn is_resolved(&self) -> bool {
        matches!(self, ToolState::OutputAvailable | ToolState::OutputError)
    }
}

/// One tool invocation inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPart {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    /// Confirmation-style tools go through the approval workflow.
    #[serde(rename = "requiresConfirmation", default)]
    pub requires_confirmation: bool,
    /// True when the backend produced the output; false when the caller
    /// executed the tool locally and attached the output itself.
    #[serde(rename = "providerExecuted", default)]
    pub provider_executed: bool,
    pub state: ToolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One part of a UI message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
    Tool(ToolPart),
}

/// One message in the caller-owned conversation history. These are also the
/// payload of the outbound `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
}
