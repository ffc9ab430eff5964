//! Bootloader protocol model shared by the HTTP bridge and its tests.
//!
//! The device speaks one JSON text frame out, one JSON text frame back. A
//! reply carries no type tag of its own, so it is decoded against the kind of
//! the command that is outstanding:
//!
//! ```text
//! bridge ── {"commandId":5,"address":134234112,"count":4} ──▶ device
//! bridge ◀──────────── {"status":true,"error":0} ──────────── device
//! ```
//!
//! - [`Command`] / [`CommandKind`]: what the bridge may ask for
//! - [`Response`]: the typed reply for each kind
//! - [`Nack`] / [`error_strings`]: the device's failure bitmask

mod command;
mod encoding;
mod error;
mod nack;
mod response;

pub use command::{
    Command, CommandKind, EraseFlashRequest, ReadFlashRequest, WriteFlashRequest,
};
pub use error::{ProtocolError, Result};
pub use nack::{Nack, error_strings};
pub use response::{
    FlashReadReply, ReplyStatus, Response, VersionReply, decode_reply,
};
