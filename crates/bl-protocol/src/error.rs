//! Codec error types.

use thiserror::Error;

use crate::CommandKind;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding commands or decoding device replies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The command could not be serialized.
    #[error("failed to encode {kind} command: {source}")]
    Encode {
        kind: CommandKind,
        #[source]
        source: serde_json::Error,
    },

    /// The device reply was not valid JSON for the outstanding command.
    #[error("failed to decode {kind} reply: {source}")]
    Decode {
        kind: CommandKind,
        #[source]
        source: serde_json::Error,
    },

    /// The device answered with a frame type the protocol does not use.
    #[error("unexpected {0} frame from device")]
    UnexpectedFrame(&'static str),
}
