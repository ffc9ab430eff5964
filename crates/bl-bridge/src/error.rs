//! Error types for the bridge.

use std::time::Duration;

use bl_protocol::{CommandKind, ProtocolError};
use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Why an `execute` call produced no response.
///
/// A device NACK is not an error: it comes back as a normal
/// [`bl_protocol::Response`] with `status == false`.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The command mailbox was full when the command was submitted.
    #[error("command mailbox is full; device busy or not connected")]
    Overloaded,

    /// The device connection closed while the command was outstanding.
    #[error("device link lost before a reply arrived")]
    LinkLost,

    /// The device stopped answering mid-exchange.
    #[error("device did not reply within {0:?}")]
    DeviceTimeout(Duration),

    /// The reply could not be handed to the caller because the response
    /// mailbox was still occupied.
    #[error("response mailbox was full; reply dropped")]
    ResponseDropped,

    /// No reply arrived before the request deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The device sent something that is not a valid reply.
    #[error("malformed device reply: {0}")]
    Malformed(String),

    /// The reply kind does not match the command that was sent.
    #[error("reply kind {got} does not match command {expected}")]
    Mismatch {
        expected: CommandKind,
        got: CommandKind,
    },
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        BridgeError::Malformed(err.to_string())
    }
}

/// Errors from the status hub handle.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("status hub is not running")]
    Closed,
}

/// Errors loading [`crate::BridgeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}
