//! agentlink — client-side protocol engine for streaming agent chat.
//!
//! One persistent bidirectional WebSocket to an agent backend, treated as a
//! sequence of independent request/response chunk streams, with an
//! out-of-band PCM audio sub-stream and a tool-approval workflow:
//!
//! - [`transport::Transport`] owns the single connection, opens/reuses it
//!   across turns, and hands out one [`transport::ChunkStream`] per
//!   `send_messages` call.
//! - [`receiver::TurnReceiver`] is the per-turn state machine: exactly one
//!   terminal per turn, exactly one stream close per terminal, PCM
//!   interception, and the approval/finish-step hold-open pattern.
//! - [`sender::EventSender`] builds and dispatches the six outbound event
//!   kinds, fire-and-forget.
//! - [`resubmit::should_resubmit`] decides, after any approval mutation,
//!   whether the client must autonomously resend state to the backend.

pub mod audio;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod resubmit;
pub mod sender;
pub mod transport;

pub use audio::{AudioError, AudioSink, PcmFormat};
pub use error::{ProtocolError, StreamError};
pub use protocol::{
    AudioAction, FinishMetadata, InboundChunk, MessageBatch, MessagePart, OutboundEvent, Role,
    SubmitTrigger, ToolPart, ToolState, UiMessage,
};
pub use receiver::{TurnController, TurnReceiver};
pub use resubmit::{respond_to_approval, should_resubmit};
pub use sender::EventSender;
pub use transport::{ChunkStream, ConnectionState, Transport, TransportConfig};
