//! Device link counters
//!
//! Tracks what the device link did and, in particular, the faults that leave a
//! caller without an answer:
//! - Commands sent and replies received
//! - Commands discarded because their caller had already given up
//! - Malformed replies
//! - Replies dropped because the response mailbox was occupied

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::mailbox::RequestId;

/// Shared counters, written by the device link and read by the API.
#[derive(Debug)]
pub struct LinkStats {
    /// Device connections accepted
    pub links_opened: AtomicU64,

    /// Commands written to the device
    pub commands_sent: AtomicU64,

    /// Reply frames read from the device
    pub replies_received: AtomicU64,

    /// Envelopes skipped because their deadline had passed
    pub expired_commands: AtomicU64,

    /// Replies that failed to decode
    pub malformed_replies: AtomicU64,

    /// Replies the response mailbox refused
    pub responses_dropped: AtomicU64,

    /// Request id of the most recent dropped reply, 0 if none
    last_dropped: watch::Sender<u64>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            links_opened: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            expired_commands: AtomicU64::new(0),
            malformed_replies: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            last_dropped: watch::channel(0).0,
        }
    }
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_opened(&self) {
        self.links_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_expired(&self) {
        self.expired_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_malformed(&self) {
        self.malformed_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_dropped(&self, id: RequestId) {
        self.responses_dropped.fetch_add(1, Ordering::Relaxed);
        self.last_dropped.send_replace(id.0);
    }

    /// Watches the id of the most recent dropped reply.
    pub fn dropped_replies(&self) -> watch::Receiver<u64> {
        self.last_dropped.subscribe()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            links_opened: self.links_opened.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            expired_commands: self.expired_commands.load(Ordering::Relaxed),
            malformed_replies: self.malformed_replies.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub links_opened: u64,
    pub commands_sent: u64,
    pub replies_received: u64,
    pub expired_commands: u64,
    pub malformed_replies: u64,
    pub responses_dropped: u64,
}
