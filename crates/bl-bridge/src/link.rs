//! The device link: one connection, one command at a time.
//!
//! ```text
//! Disconnected ──(device upgrade)──▶ Connected ──(close / error / timeout)──▶ Disconnected
//! ```
//!
//! While connected the loop takes an envelope, sends it, waits for exactly one
//! reply, decodes it against the kind it just sent and publishes the result.
//! Whatever goes wrong while a command is outstanding becomes a
//! [`BridgeError`] in the response mailbox, so the caller is never left
//! waiting on a reply that cannot come.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bl_protocol::{ProtocolError, decode_reply};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::hub::{ConnectivityEvent, HubHandle};
use crate::mailbox::{CommandInbox, Envelope, Reply, RequestId, ResponseMailbox};
use crate::stats::LinkStats;
use crate::transport::{DeviceTransport, Frame, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

fn announce(hub: &HubHandle, state: LinkState, peer: &str) {
    let event = match state {
        LinkState::Connected => ConnectivityEvent::Connected,
        LinkState::Disconnected => ConnectivityEvent::Disconnected,
    };
    info!(%peer, %event, "device connectivity changed");
    if hub.publish(event).is_err() {
        warn!(%event, "status hub is gone; connectivity not broadcast");
    }
}

/// Why a connected session ended.
#[derive(Debug)]
pub enum LinkEnd {
    Closed,
    Transport(String),
    ReplyTimeout(Duration),
    /// Every command producer is gone; the bridge is shutting down.
    Shutdown,
}

impl From<TransportError> for LinkEnd {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => LinkEnd::Closed,
            TransportError::Io(message) => LinkEnd::Transport(message),
        }
    }
}

impl fmt::Display for LinkEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEnd::Closed => f.write_str("closed by device"),
            LinkEnd::Transport(message) => write!(f, "transport error: {message}"),
            LinkEnd::ReplyTimeout(after) => write!(f, "no reply within {after:?}"),
            LinkEnd::Shutdown => f.write_str("bridge shutting down"),
        }
    }
}

/// Everything a device session needs. Cheap to clone; only one clone at a
/// time can [`claim`](DeviceLink::claim) the command inbox.
#[derive(Clone)]
pub struct DeviceLink {
    inbox: Arc<Mutex<CommandInbox>>,
    responses: ResponseMailbox,
    hub: HubHandle,
    stats: Arc<LinkStats>,
    reply_timeout: Duration,
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("reply_timeout", &self.reply_timeout)
            .finish_non_exhaustive()
    }
}

impl DeviceLink {
    pub fn new(
        inbox: CommandInbox,
        responses: ResponseMailbox,
        hub: HubHandle,
        stats: Arc<LinkStats>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            inbox: Arc::new(Mutex::new(inbox)),
            responses,
            hub,
            stats,
            reply_timeout,
        }
    }

    /// Takes exclusive ownership of the command inbox, or `None` while another
    /// device session holds it.
    pub fn claim(&self) -> Option<ActiveLink> {
        let inbox = Arc::clone(&self.inbox).try_lock_owned().ok()?;
        Some(ActiveLink {
            inbox,
            responses: self.responses.clone(),
            hub: self.hub.clone(),
            stats: Arc::clone(&self.stats),
            reply_timeout: self.reply_timeout,
        })
    }
}

/// A claimed device link, ready to run over one transport.
pub struct ActiveLink {
    inbox: OwnedMutexGuard<CommandInbox>,
    responses: ResponseMailbox,
    hub: HubHandle,
    stats: Arc<LinkStats>,
    reply_timeout: Duration,
}

impl ActiveLink {
    /// Runs the session until the transport goes away. The inbox is released
    /// before `Disconnected` is announced.
    pub async fn run<T: DeviceTransport>(mut self, mut transport: T, peer: &str) -> LinkEnd {
        self.stats.link_opened();
        announce(&self.hub, LinkState::Connected, peer);

        let end = self.serve(&mut transport).await;
        info!(%peer, reason = %end, "device link ended");

        let ActiveLink { inbox, hub, .. } = self;
        drop(inbox);
        announce(&hub, LinkState::Disconnected, peer);
        end
    }

    async fn serve<T: DeviceTransport>(&mut self, transport: &mut T) -> LinkEnd {
        loop {
            debug!("waiting for command");
            let envelope = tokio::select! {
                envelope = self.inbox.next() => match envelope {
                    Some(envelope) => envelope,
                    None => return LinkEnd::Shutdown,
                },
                frame = transport.next_frame() => match frame {
                    Ok(frame) => {
                        warn!(frame = frame.kind(), "ignoring unsolicited device frame");
                        continue;
                    }
                    Err(err) => return err.into(),
                },
            };

            if let Some(end) = self.exchange(envelope, transport).await {
                return end;
            }
        }
    }

    /// One command/reply round trip. Returns `Some` when the session cannot
    /// continue.
    async fn exchange<T: DeviceTransport>(
        &mut self,
        envelope: Envelope,
        transport: &mut T,
    ) -> Option<LinkEnd> {
        let id = envelope.id;
        let kind = envelope.command.kind();

        if envelope.is_expired() {
            self.stats.command_expired();
            warn!(request = %id, %kind, "discarding command whose caller gave up");
            return None;
        }

        let text = match envelope.command.encode() {
            Ok(text) => text,
            Err(err) => {
                self.deliver(id, Err(err.into()));
                return None;
            }
        };

        debug!(request = %id, %kind, frame = %text, "sending command");
        if let Err(err) = transport.send_text(text).await {
            self.deliver(id, Err(BridgeError::LinkLost));
            return Some(err.into());
        }
        self.stats.command_sent();

        let frame = match timeout(self.reply_timeout, transport.next_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                self.deliver(id, Err(BridgeError::LinkLost));
                return Some(err.into());
            }
            Err(_) => {
                // A late reply would be taken for the next command's.
                self.deliver(id, Err(BridgeError::DeviceTimeout(self.reply_timeout)));
                return Some(LinkEnd::ReplyTimeout(self.reply_timeout));
            }
        };
        self.stats.reply_received();

        let outcome = match frame {
            Frame::Text(text) => {
                debug!(request = %id, %kind, frame = %text, "received reply");
                decode_reply(kind, &text)
            }
            Frame::Binary(_) => Err(ProtocolError::UnexpectedFrame("binary")),
        };
        let outcome = outcome.map_err(|err| {
            self.stats.reply_malformed();
            warn!(request = %id, %kind, error = %err, "malformed device reply");
            BridgeError::from(err)
        });
        self.deliver(id, outcome);
        None
    }

    fn deliver(&self, id: RequestId, outcome: Result<bl_protocol::Response, BridgeError>) {
        if let Err(err) = self.responses.publish(Reply { id, outcome }) {
            self.stats.response_dropped(id);
            error!(
                request = %id,
                error = %err,
                "response mailbox refused reply; its caller will not receive it"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::spawn_hub;
    use crate::mailbox::{command_mailbox, response_mailbox};
    use bl_protocol::{Command, CommandKind, EraseFlashRequest, Response};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// In-memory device end. Frames pushed into `incoming` are what the
    /// device "says"; everything the link sends shows up on `sent`.
    struct FakeTransport {
        incoming: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
        sent: mpsc::UnboundedSender<String>,
    }

    #[async_trait::async_trait]
    impl DeviceTransport for FakeTransport {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.send(text).map_err(|_| TransportError::Closed)
        }

        async fn next_frame(&mut self) -> Result<Frame, TransportError> {
            match self.incoming.recv().await {
                Some(frame) => frame,
                None => Err(TransportError::Closed),
            }
        }
    }

    struct Harness {
        commands: crate::mailbox::CommandMailbox,
        replies: crate::mailbox::ResponseInbox,
        link: DeviceLink,
        hub: HubHandle,
        stats: Arc<LinkStats>,
    }

    fn harness(reply_timeout: Duration) -> Harness {
        let (hub, _join) = spawn_hub(8);
        let (commands, inbox) = command_mailbox(5);
        let (responses, replies) = response_mailbox();
        let stats = Arc::new(LinkStats::new());
        let link = DeviceLink::new(inbox, responses, hub.clone(), Arc::clone(&stats), reply_timeout);
        Harness {
            commands,
            replies,
            link,
            hub,
            stats,
        }
    }

    fn fake() -> (
        FakeTransport,
        mpsc::UnboundedSender<Result<Frame, TransportError>>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (device_tx, incoming) = mpsc::unbounded_channel();
        let (sent, device_rx) = mpsc::unbounded_channel();
        (FakeTransport { incoming, sent }, device_tx, device_rx)
    }

    fn envelope(id: u64, command: Command) -> Envelope {
        Envelope {
            id: RequestId(id),
            command,
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_round_trip_decodes_by_sent_kind() {
        let mut h = harness(Duration::from_secs(5));
        let (transport, device_tx, mut device_rx) = fake();
        let active = h.link.claim().unwrap();
        let session = tokio::spawn(async move { active.run(transport, "test").await });

        h.commands
            .submit(envelope(
                1,
                Command::EraseFlash(EraseFlashRequest {
                    address: 0x0800_4000,
                    count: 4,
                }),
            ))
            .unwrap();
        assert_eq!(
            device_rx.recv().await.unwrap(),
            r#"{"commandId":5,"address":134234112,"count":4}"#
        );
        device_tx
            .send(Ok(Frame::Text(r#"{"status":true,"error":0}"#.into())))
            .unwrap();

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.id, RequestId(1));
        let response = reply.outcome.unwrap();
        assert_eq!(response.kind(), CommandKind::EraseFlash);
        assert!(response.is_success());

        drop(device_tx);
        assert!(matches!(session.await.unwrap(), LinkEnd::Closed));
        assert_eq!(h.stats.snapshot().commands_sent, 1);
    }

    #[tokio::test]
    async fn test_second_claim_is_refused_until_released() {
        let h = harness(Duration::from_secs(5));
        let first = h.link.claim().unwrap();
        assert!(h.link.claim().is_none());
        drop(first);
        assert!(h.link.claim().is_some());
    }

    #[tokio::test]
    async fn test_connectivity_is_broadcast() {
        let h = harness(Duration::from_secs(5));
        let mut sub = h.hub.register().await.unwrap();
        assert_eq!(sub.recv().await, Some(ConnectivityEvent::Disconnected));

        let (transport, device_tx, _device_rx) = fake();
        let active = h.link.claim().unwrap();
        let session = tokio::spawn(async move { active.run(transport, "test").await });
        assert_eq!(sub.recv().await, Some(ConnectivityEvent::Connected));

        // Idle disconnect is noticed without any command in flight.
        drop(device_tx);
        session.await.unwrap();
        assert_eq!(sub.recv().await, Some(ConnectivityEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_link_lost_mid_exchange_is_delivered() {
        let mut h = harness(Duration::from_secs(5));
        let (transport, device_tx, mut device_rx) = fake();
        let active = h.link.claim().unwrap();
        let session = tokio::spawn(async move { active.run(transport, "test").await });

        h.commands.submit(envelope(7, Command::ReadVersion)).unwrap();
        device_rx.recv().await.unwrap();
        device_tx
            .send(Err(TransportError::Io("connection reset".into())))
            .unwrap();

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.id, RequestId(7));
        assert!(matches!(reply.outcome, Err(BridgeError::LinkLost)));
        assert!(matches!(session.await.unwrap(), LinkEnd::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_and_ends_session() {
        let mut h = harness(Duration::from_secs(2));
        let (transport, _device_tx, mut device_rx) = fake();
        let active = h.link.claim().unwrap();
        let session = tokio::spawn(async move { active.run(transport, "test").await });

        h.commands.submit(envelope(3, Command::JumpToApp)).unwrap();
        device_rx.recv().await.unwrap();

        let reply = h.replies.recv().await.unwrap();
        assert!(matches!(reply.outcome, Err(BridgeError::DeviceTimeout(_))));
        assert!(matches!(session.await.unwrap(), LinkEnd::ReplyTimeout(_)));
    }

    #[tokio::test]
    async fn test_malformed_reply_keeps_session_alive() {
        let mut h = harness(Duration::from_secs(5));
        let (transport, device_tx, mut device_rx) = fake();
        let active = h.link.claim().unwrap();
        let _session = tokio::spawn(async move { active.run(transport, "test").await });

        h.commands.submit(envelope(1, Command::ReadVersion)).unwrap();
        device_rx.recv().await.unwrap();
        device_tx.send(Ok(Frame::Binary(vec![0xff]))).unwrap();
        let reply = h.replies.recv().await.unwrap();
        assert!(matches!(reply.outcome, Err(BridgeError::Malformed(_))));

        h.commands.submit(envelope(2, Command::ReadVersion)).unwrap();
        device_rx.recv().await.unwrap();
        device_tx
            .send(Ok(Frame::Text(r#"{"error":0,"version":3}"#.into())))
            .unwrap();
        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.id, RequestId(2));
        let Ok(Response::ReadVersion(version)) = reply.outcome else {
            panic!("expected version reply");
        };
        assert_eq!(version.version, 3);
        assert_eq!(h.stats.snapshot().malformed_replies, 1);
    }

    #[tokio::test]
    async fn test_expired_commands_are_not_sent() {
        let mut h = harness(Duration::from_secs(5));
        let (transport, device_tx, mut device_rx) = fake();

        let mut stale = envelope(1, Command::EraseFlash(EraseFlashRequest { address: 0, count: 1 }));
        stale.deadline = Instant::now();
        h.commands.submit(stale).unwrap();
        h.commands.submit(envelope(2, Command::ReadVersion)).unwrap();

        let active = h.link.claim().unwrap();
        let _session = tokio::spawn(async move { active.run(transport, "test").await });

        assert_eq!(device_rx.recv().await.unwrap(), r#"{"commandId":4}"#);
        device_tx.send(Ok(Frame::Text("{}".into()))).unwrap();
        assert_eq!(h.replies.recv().await.unwrap().id, RequestId(2));
        assert_eq!(h.stats.snapshot().expired_commands, 1);
    }

    #[tokio::test]
    async fn test_uncollected_reply_is_counted_as_dropped() {
        let h = harness(Duration::from_secs(5));
        let (transport, device_tx, mut device_rx) = fake();
        let active = h.link.claim().unwrap();
        let _session = tokio::spawn(async move { active.run(transport, "test").await });

        // Nobody reads replies: the first fills the slot, the second is dropped.
        for id in 1..=2 {
            h.commands.submit(envelope(id, Command::JumpToApp)).unwrap();
            device_rx.recv().await.unwrap();
            device_tx.send(Ok(Frame::Text("{}".into()))).unwrap();
        }
        // The third send proves the second exchange has completed.
        h.commands.submit(envelope(3, Command::JumpToApp)).unwrap();
        device_rx.recv().await.unwrap();

        assert_eq!(h.stats.snapshot().responses_dropped, 1);
        assert_eq!(*h.stats.dropped_replies().borrow(), 2);
    }
}
