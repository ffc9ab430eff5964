//! Commands the bridge can send to the bootloader.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::error::{ProtocolError, Result};

/// Discriminant shared by a command and the reply it triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    WriteFlash,
    ReadFlash,
    ReadVersion,
    EraseFlash,
    JumpToApp,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::WriteFlash,
        CommandKind::ReadFlash,
        CommandKind::ReadVersion,
        CommandKind::EraseFlash,
        CommandKind::JumpToApp,
    ];

    /// Command id understood by the bootloader firmware.
    ///
    /// Id 7 (enter command mode) is reserved on the device and never sent by
    /// the bridge.
    pub const fn id(self) -> u8 {
        match self {
            CommandKind::WriteFlash => 2,
            CommandKind::ReadFlash => 3,
            CommandKind::ReadVersion => 4,
            CommandKind::EraseFlash => 5,
            CommandKind::JumpToApp => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::WriteFlash => "write_flash",
            CommandKind::ReadFlash => "read_flash",
            CommandKind::ReadVersion => "read_version",
            CommandKind::EraseFlash => "erase_flash",
            CommandKind::JumpToApp => "jump_to_app",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Erase `count` flash pages starting at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraseFlashRequest {
    pub address: u32,
    pub count: u32,
}

/// Read `length` bytes of flash starting at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFlashRequest {
    pub address: u32,
    pub length: u32,
}

/// Program `data` into flash starting at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFlashRequest {
    pub address: u32,
    #[serde(rename = "binaryData", with = "base64_bytes")]
    pub data: Vec<u8>,
    pub size: u32,
}

impl WriteFlashRequest {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self { address, data, size }
    }
}

/// A bootloader command. Built once by a caller, encoded once by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReadVersion,
    EraseFlash(EraseFlashRequest),
    WriteFlash(WriteFlashRequest),
    ReadFlash(ReadFlashRequest),
    JumpToApp,
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    #[serde(rename = "commandId")]
    command_id: u8,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct NoFields {}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ReadVersion => CommandKind::ReadVersion,
            Command::EraseFlash(_) => CommandKind::EraseFlash,
            Command::WriteFlash(_) => CommandKind::WriteFlash,
            Command::ReadFlash(_) => CommandKind::ReadFlash,
            Command::JumpToApp => CommandKind::JumpToApp,
        }
    }

    /// Serializes the command into the JSON text frame sent to the device.
    pub fn encode(&self) -> Result<String> {
        let kind = self.kind();
        match self {
            Command::ReadVersion | Command::JumpToApp => frame(kind, &NoFields {}),
            Command::EraseFlash(request) => frame(kind, request),
            Command::WriteFlash(request) => frame(kind, request),
            Command::ReadFlash(request) => frame(kind, request),
        }
    }
}

fn frame<T: Serialize>(kind: CommandKind, body: &T) -> Result<String> {
    let frame = Frame {
        command_id: kind.id(),
        body,
    };
    serde_json::to_string(&frame).map_err(|source| ProtocolError::Encode { kind, source })
}
