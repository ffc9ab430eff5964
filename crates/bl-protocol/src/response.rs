//! Typed replies and the reply decoder.

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::encoding::base64_bytes;
use crate::error::{ProtocolError, Result};
use crate::nack::error_strings;

/// Outcome fields common to every reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyStatus {
    /// `true` when the device accepted and completed the command.
    pub status: bool,
    /// Raw NACK bitmask.
    pub error: u8,
    /// Messages for each bit set in `error`, filled in by the bridge.
    pub errors: Vec<String>,
}

impl ReplyStatus {
    /// A reply is a success only if no NACK bit is set and the device did not
    /// explicitly report failure.
    fn from_wire(status: Option<bool>, error: u8) -> Self {
        Self {
            status: error == 0 && status.unwrap_or(true),
            error,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReply {
    #[serde(flatten)]
    pub result: ReplyStatus,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReadReply {
    #[serde(rename = "binaryData", with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(flatten)]
    pub result: ReplyStatus,
}

/// A decoded device reply. Serializes to the flat JSON object returned to
/// HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    ReadVersion(VersionReply),
    EraseFlash(ReplyStatus),
    WriteFlash(ReplyStatus),
    ReadFlash(FlashReadReply),
    JumpToApp(ReplyStatus),
}

impl Response {
    pub fn kind(&self) -> CommandKind {
        match self {
            Response::ReadVersion(_) => CommandKind::ReadVersion,
            Response::EraseFlash(_) => CommandKind::EraseFlash,
            Response::WriteFlash(_) => CommandKind::WriteFlash,
            Response::ReadFlash(_) => CommandKind::ReadFlash,
            Response::JumpToApp(_) => CommandKind::JumpToApp,
        }
    }

    pub fn result(&self) -> &ReplyStatus {
        match self {
            Response::ReadVersion(reply) => &reply.result,
            Response::ReadFlash(reply) => &reply.result,
            Response::EraseFlash(result)
            | Response::WriteFlash(result)
            | Response::JumpToApp(result) => result,
        }
    }

    fn result_mut(&mut self) -> &mut ReplyStatus {
        match self {
            Response::ReadVersion(reply) => &mut reply.result,
            Response::ReadFlash(reply) => &mut reply.result,
            Response::EraseFlash(result)
            | Response::WriteFlash(result)
            | Response::JumpToApp(result) => result,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result().status
    }

    /// Fills `errors` from the raw bitmask via [`error_strings`].
    pub fn with_error_strings(mut self) -> Self {
        let result = self.result_mut();
        result.errors = error_strings(result.error);
        self
    }
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    status: Option<bool>,
    #[serde(default)]
    error: u8,
    #[serde(default)]
    version: u8,
    #[serde(default, rename = "binaryData", with = "base64_bytes")]
    data: Vec<u8>,
}

/// Decodes a reply text frame as the reply to a `kind` command.
///
/// Frames carry no type tag; the caller must pass the kind of the command that
/// is outstanding.
pub fn decode_reply(kind: CommandKind, text: &str) -> Result<Response> {
    let wire: WireReply =
        serde_json::from_str(text).map_err(|source| ProtocolError::Decode { kind, source })?;
    let result = ReplyStatus::from_wire(wire.status, wire.error);
    let response = match kind {
        CommandKind::ReadVersion => Response::ReadVersion(VersionReply {
            result,
            version: wire.version,
        }),
        CommandKind::ReadFlash => Response::ReadFlash(FlashReadReply {
            data: wire.data,
            result,
        }),
        CommandKind::EraseFlash => Response::EraseFlash(result),
        CommandKind::WriteFlash => Response::WriteFlash(result),
        CommandKind::JumpToApp => Response::JumpToApp(result),
    };
    Ok(response)
}
