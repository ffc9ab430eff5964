//! The `execute` façade used by HTTP handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bl_protocol::{Command, Response};
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::mailbox::{CommandMailbox, Envelope, MailboxError, RequestId, ResponseInbox};
use crate::stats::LinkStats;

/// Submits commands to the device link and waits for their replies, one
/// caller at a time.
///
/// At most as many callers as the command mailbox holds are admitted; the
/// rest are turned away with [`BridgeError::Overloaded`] without waiting.
pub struct CommandBridge {
    commands: CommandMailbox,
    admission: Semaphore,
    /// Held for the whole of one `execute`.
    replies: Mutex<ResponseInbox>,
    next_id: AtomicU64,
    request_timeout: Duration,
    stats: Arc<LinkStats>,
}

impl CommandBridge {
    pub fn new(
        commands: CommandMailbox,
        replies: ResponseInbox,
        stats: Arc<LinkStats>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            admission: Semaphore::new(commands.capacity()),
            commands,
            replies: Mutex::new(replies),
            next_id: AtomicU64::new(1),
            request_timeout,
            stats,
        }
    }

    /// Sends `command` to the device and returns its reply with error
    /// strings attached.
    ///
    /// A full command mailbox fails at once with [`BridgeError::Overloaded`];
    /// everything else is bounded by the request timeout.
    pub async fn execute(&self, command: Command) -> Result<Response> {
        let deadline = Instant::now() + self.request_timeout;
        let kind = command.kind();

        let _admitted = self
            .admission
            .try_acquire()
            .map_err(|_| BridgeError::Overloaded)?;
        let mut replies = timeout_at(deadline, self.replies.lock())
            .await
            .map_err(|_| BridgeError::Timeout(self.request_timeout))?;

        let stale = replies.discard_stale();
        if stale > 0 {
            warn!(stale, "discarded replies left by an earlier caller");
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut dropped = self.stats.dropped_replies();
        self.commands
            .submit(Envelope {
                id,
                command,
                deadline,
            })
            .map_err(|err| match err {
                MailboxError::Full => BridgeError::Overloaded,
                MailboxError::Closed => BridgeError::LinkLost,
            })?;
        debug!(request = %id, %kind, "command submitted");

        let waited = timeout_at(deadline, async {
            loop {
                tokio::select! {
                    reply = replies.recv() => match reply {
                        Some(reply) if reply.id == id => return reply.outcome,
                        Some(reply) => {
                            warn!(request = %id, stale = %reply.id, "discarding stale reply");
                        }
                        None => return Err(BridgeError::LinkLost),
                    },
                    // The link could not hand over our reply; it is not coming.
                    seen = dropped.wait_for(|last| *last == id.0).map(|seen| seen.is_ok()) => {
                        return Err(if seen {
                            BridgeError::ResponseDropped
                        } else {
                            BridgeError::LinkLost
                        });
                    }
                }
            }
        })
        .await;

        let response = match waited {
            Ok(outcome) => outcome?,
            Err(_) => return Err(BridgeError::Timeout(self.request_timeout)),
        };

        if response.kind() != kind {
            return Err(BridgeError::Mismatch {
                expected: kind,
                got: response.kind(),
            });
        }
        debug!(request = %id, %kind, success = response.is_success(), "reply received");
        Ok(response.with_error_strings())
    }

    /// Commands accepted but not yet taken by the device link.
    pub fn pending(&self) -> usize {
        self.commands.pending()
    }

    /// Callers currently inside `execute`.
    pub fn callers(&self) -> usize {
        self.commands.capacity() - self.admission.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{CommandInbox, Reply, ResponseMailbox, command_mailbox, response_mailbox};
    use bl_protocol::{CommandKind, EraseFlashRequest, decode_reply};
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    struct Harness {
        bridge: Arc<CommandBridge>,
        inbox: CommandInbox,
        responses: ResponseMailbox,
        stats: Arc<LinkStats>,
    }

    fn harness(capacity: usize, request_timeout: Duration) -> Harness {
        let (commands, inbox) = command_mailbox(capacity);
        let (responses, replies) = response_mailbox();
        let stats = Arc::new(LinkStats::new());
        let bridge = Arc::new(CommandBridge::new(
            commands,
            replies,
            Arc::clone(&stats),
            request_timeout,
        ));
        Harness {
            bridge,
            inbox,
            responses,
            stats,
        }
    }

    fn reply(id: RequestId, kind: CommandKind, text: &str) -> Reply {
        Reply {
            id,
            outcome: Ok(decode_reply(kind, text).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_execute_returns_reply_with_error_strings() {
        let mut h = harness(5, Duration::from_secs(5));
        let bridge = Arc::clone(&h.bridge);
        let call = tokio::spawn(async move { bridge.execute(Command::ReadVersion).await });

        let envelope = h.inbox.next().await.unwrap();
        assert_eq!(envelope.id, RequestId(1));
        h.responses
            .publish(reply(envelope.id, CommandKind::ReadVersion, r#"{"status":false,"error":4}"#))
            .unwrap();

        let response = call.await.unwrap().unwrap();
        assert!(!response.is_success());
        assert_eq!(response.result().errors, vec!["Invalid address".to_string()]);
    }

    #[tokio::test]
    async fn test_full_mailbox_is_overloaded_immediately() {
        // Nothing consumes the inbox: one slot, then overload.
        let h = harness(1, Duration::from_millis(100));
        let bridge = Arc::clone(&h.bridge);
        let first = tokio::spawn(async move { bridge.execute(Command::JumpToApp).await });
        assert!(matches!(first.await.unwrap(), Err(BridgeError::Timeout(_))));

        let started = Instant::now();
        let second = h.bridge.execute(Command::JumpToApp).await;
        assert!(matches!(second, Err(BridgeError::Overloaded)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_callers_beyond_capacity_are_turned_away_at_once() {
        // No device: admitted callers wait out their deadline.
        let h = harness(5, Duration::from_secs(2));
        let mut waiting = Vec::new();
        for _ in 0..5 {
            let bridge = Arc::clone(&h.bridge);
            waiting.push(tokio::spawn(async move { bridge.execute(Command::JumpToApp).await }));
        }
        while h.bridge.callers() < 5 {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        let extra = h.bridge.execute(Command::JumpToApp).await;
        assert!(matches!(extra, Err(BridgeError::Overloaded)));
        assert!(started.elapsed() < Duration::from_millis(100));

        for call in waiting {
            assert!(matches!(call.await.unwrap(), Err(BridgeError::Timeout(_))));
        }
        assert_eq!(h.bridge.callers(), 0);
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let mut h = harness(5, Duration::from_secs(5));
        let bridge = Arc::clone(&h.bridge);
        let call = tokio::spawn(async move {
            bridge
                .execute(Command::EraseFlash(EraseFlashRequest {
                    address: 0x0800_0000,
                    count: 1,
                }))
                .await
        });

        let envelope = h.inbox.next().await.unwrap();
        h.responses
            .publish(reply(RequestId(99), CommandKind::EraseFlash, "{}"))
            .unwrap();
        // The slot frees once the bridge has read and discarded the stale reply.
        while h
            .responses
            .publish(reply(envelope.id, CommandKind::EraseFlash, r#"{"status":true,"error":0}"#))
            .is_err()
        {
            tokio::task::yield_now().await;
        }

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.kind(), CommandKind::EraseFlash);
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_reported() {
        let mut h = harness(5, Duration::from_secs(5));
        let bridge = Arc::clone(&h.bridge);
        let call = tokio::spawn(async move { bridge.execute(Command::ReadVersion).await });

        let envelope = h.inbox.next().await.unwrap();
        h.responses
            .publish(reply(envelope.id, CommandKind::JumpToApp, "{}"))
            .unwrap();

        assert!(matches!(
            call.await.unwrap(),
            Err(BridgeError::Mismatch {
                expected: CommandKind::ReadVersion,
                got: CommandKind::JumpToApp,
            })
        ));
    }

    #[tokio::test]
    async fn test_link_fault_is_passed_through() {
        let mut h = harness(5, Duration::from_secs(5));
        let bridge = Arc::clone(&h.bridge);
        let call = tokio::spawn(async move { bridge.execute(Command::ReadVersion).await });

        let envelope = h.inbox.next().await.unwrap();
        h.responses
            .publish(Reply {
                id: envelope.id,
                outcome: Err(BridgeError::LinkLost),
            })
            .unwrap();
        assert!(matches!(call.await.unwrap(), Err(BridgeError::LinkLost)));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_reported_without_waiting_out_the_deadline() {
        let mut h = harness(5, Duration::from_secs(10));
        let bridge = Arc::clone(&h.bridge);
        let call = tokio::spawn(async move { bridge.execute(Command::JumpToApp).await });

        let envelope = h.inbox.next().await.unwrap();
        let started = Instant::now();
        h.stats.response_dropped(envelope.id);
        let outcome = timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(BridgeError::ResponseDropped)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_call_after_a_dropped_reply_succeeds() {
        let mut h = harness(5, Duration::from_secs(5));

        let bridge = Arc::clone(&h.bridge);
        let first = tokio::spawn(async move { bridge.execute(Command::JumpToApp).await });
        let envelope = h.inbox.next().await.unwrap();
        h.stats.response_dropped(envelope.id);
        assert!(matches!(first.await.unwrap(), Err(BridgeError::ResponseDropped)));

        let bridge = Arc::clone(&h.bridge);
        let second = tokio::spawn(async move { bridge.execute(Command::JumpToApp).await });
        let envelope = h.inbox.next().await.unwrap();
        assert_eq!(envelope.id, RequestId(2));
        h.responses
            .publish(reply(envelope.id, CommandKind::JumpToApp, "{}"))
            .unwrap();
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_link_lost() {
        let h = harness(5, Duration::from_secs(1));
        drop(h.inbox);
        assert!(matches!(
            h.bridge.execute(Command::ReadVersion).await,
            Err(BridgeError::LinkLost)
        ));
    }

    #[tokio::test]
    async fn test_ids_increase_per_call() {
        let mut h = harness(5, Duration::from_secs(5));
        for expected in 1..=3 {
            let bridge = Arc::clone(&h.bridge);
            let call = tokio::spawn(async move { bridge.execute(Command::JumpToApp).await });
            let envelope = h.inbox.next().await.unwrap();
            assert_eq!(envelope.id, RequestId(expected));
            h.responses
                .publish(reply(envelope.id, CommandKind::JumpToApp, "{}"))
                .unwrap();
            assert!(call.await.unwrap().is_ok());
        }
        assert_eq!(h.bridge.pending(), 0);
    }
}
