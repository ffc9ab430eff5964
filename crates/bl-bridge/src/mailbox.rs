//! Bounded mailboxes between HTTP callers and the device link.
//!
//! ```text
//! execute() ──submit──▶ [ command mailbox (5) ] ──next──▶ device link
//! execute() ◀──recv──── [ response mailbox (1) ] ◀─publish─ device link
//! ```
//!
//! Neither producer side ever blocks: a full mailbox is reported as
//! [`MailboxError::Full`] and the caller decides what that means.

use std::fmt;

use bl_protocol::{Command, Response};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::error::BridgeError;

pub const DEFAULT_COMMAND_CAPACITY: usize = 5;

/// The response mailbox holds exactly one reply.
const RESPONSE_CAPACITY: usize = 1;

/// Correlation token assigned by the bridge to each submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A command on its way to the device.
#[derive(Debug)]
pub struct Envelope {
    pub id: RequestId,
    pub command: Command,
    /// After this instant nobody is waiting for the reply.
    pub deadline: Instant,
}

impl Envelope {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// The device link's answer to one envelope.
#[derive(Debug)]
pub struct Reply {
    pub id: RequestId,
    pub outcome: Result<Response, BridgeError>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox is full")]
    Full,
    #[error("mailbox is closed")]
    Closed,
}

impl<T> From<TrySendError<T>> for MailboxError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => MailboxError::Full,
            TrySendError::Closed(_) => MailboxError::Closed,
        }
    }
}

/// Creates the command mailbox with room for `capacity` unconsumed envelopes.
pub fn command_mailbox(capacity: usize) -> (CommandMailbox, CommandInbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandMailbox { tx }, CommandInbox { rx })
}

/// Producer side of the command mailbox, shared by all callers.
#[derive(Debug, Clone)]
pub struct CommandMailbox {
    tx: mpsc::Sender<Envelope>,
}

impl CommandMailbox {
    /// Enqueues without waiting; rejects when the mailbox is full.
    pub fn submit(&self, envelope: Envelope) -> Result<(), MailboxError> {
        self.tx.try_send(envelope).map_err(MailboxError::from)
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Envelopes accepted but not yet taken by the device link.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Consumer side of the command mailbox. Only the device link holds it.
#[derive(Debug)]
pub struct CommandInbox {
    rx: mpsc::Receiver<Envelope>,
}

impl CommandInbox {
    /// Next envelope in submission order.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

pub fn response_mailbox() -> (ResponseMailbox, ResponseInbox) {
    let (tx, rx) = mpsc::channel(RESPONSE_CAPACITY);
    (ResponseMailbox { tx }, ResponseInbox { rx })
}

/// Producer side of the response mailbox, used by the device link.
#[derive(Debug, Clone)]
pub struct ResponseMailbox {
    tx: mpsc::Sender<Reply>,
}

impl ResponseMailbox {
    /// Publishes without waiting; a full slot means the previous reply was
    /// never collected.
    pub fn publish(&self, reply: Reply) -> Result<(), MailboxError> {
        self.tx.try_send(reply).map_err(MailboxError::from)
    }
}

/// Consumer side of the response mailbox, owned by the bridge.
#[derive(Debug)]
pub struct ResponseInbox {
    rx: mpsc::Receiver<Reply>,
}

impl ResponseInbox {
    /// Waits for the next reply.
    pub async fn recv(&mut self) -> Option<Reply> {
        self.rx.recv().await
    }

    /// Empties the slot of a reply nobody waited for. Returns how many were
    /// discarded.
    pub fn discard_stale(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
