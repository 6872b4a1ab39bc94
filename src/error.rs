//! Typed errors crossing the public API.
//!
//! `anyhow` is used at operation edges (connecting, handshakes); these enums
//! cover the two places a caller needs to match on the failure kind: codec
//! errors and the errors a turn's chunk stream can yield.

use thiserror::Error;

/// Errors raised by the frame codec.
///
/// Only protocol frames (`data: ...`) can fail hard. Non-protocol messages
/// that fail to parse are discarded by the codec instead of surfacing here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A `data: ` frame body was not valid JSON. Fatal for the turn, since
    /// a corrupt protocol frame means message loss would otherwise go
    /// undetected.
    #[error("malformed protocol frame: {detail}")]
    MalformedFrame { detail: String },

    /// A `data: ` frame body parsed as JSON but was not a `type`-tagged
    /// object, so it cannot be dispatched.
    #[error("protocol frame is not a type-tagged object")]
    UntaggedFrame,

    /// An outbound event failed to serialize.
    #[error("failed to encode outbound event: {detail}")]
    Encode { detail: String },
}

/// Errors yielded by a turn's chunk stream.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The codec rejected a protocol frame; the turn is failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The underlying connection failed mid-turn.
    #[error("connection error: {0}")]
    Connection(String),
}
