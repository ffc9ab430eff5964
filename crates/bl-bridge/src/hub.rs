//! Connectivity broadcast hub.
//!
//! One task owns the subscriber set and processes register, deregister,
//! publish and query requests from a single queue in arrival order. Each
//! subscriber gets its own bounded channel; the hub only ever `try_send`s, so a
//! stalled subscriber cannot hold up the publisher or anyone else.
//!
//! A subscriber whose channel is full is marked lagging. While it lags, newer
//! events replace the one it is owed; as soon as it frees a slot the hub sends
//! the latest event, so a slow reader may miss intermediate transitions but
//! always ends on the current status.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HubError;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 8;

/// Device connectivity as seen by the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

impl ConnectivityEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectivityEvent::Connected => "Connected",
            ConnectivityEvent::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectivityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

enum HubRequest {
    Register {
        reply: oneshot::Sender<(SubscriberId, mpsc::Receiver<ConnectivityEvent>)>,
    },
    Deregister(SubscriberId),
    Publish(ConnectivityEvent),
    Current {
        reply: oneshot::Sender<ConnectivityEvent>,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubRequest>,
}

impl fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Starts the hub task. Subscribers get a delivery buffer of
/// `subscriber_buffer` events (at least one).
pub fn spawn_hub(subscriber_buffer: usize) -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = StatusHub {
        requests: rx,
        subscribers: HashMap::new(),
        slots: FuturesUnordered::new(),
        current: ConnectivityEvent::Disconnected,
        buffer: subscriber_buffer.max(1),
        next_id: 0,
    };
    let join = tokio::spawn(hub.run());
    (HubHandle { tx }, join)
}

impl HubHandle {
    /// Adds a subscriber. Its first event is the current status.
    pub async fn register(&self) -> Result<Subscription, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubRequest::Register { reply })
            .map_err(|_| HubError::Closed)?;
        let (id, events) = rx.await.map_err(|_| HubError::Closed)?;
        Ok(Subscription {
            id,
            events,
            hub: self.clone(),
        })
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn deregister(&self, id: SubscriberId) {
        let _ = self.tx.send(HubRequest::Deregister(id));
    }

    /// Queues an event for every subscriber. Never waits.
    pub fn publish(&self, event: ConnectivityEvent) -> Result<(), HubError> {
        self.tx
            .send(HubRequest::Publish(event))
            .map_err(|_| HubError::Closed)
    }

    /// Last event published, or `Disconnected` if none was.
    pub async fn current(&self) -> Result<ConnectivityEvent, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubRequest::Current { reply })
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubRequest::SubscriberCount { reply })
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

/// A registered subscriber. Dropping it deregisters from the hub.
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<ConnectivityEvent>,
    hub: HubHandle,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub has gone away.
    pub async fn recv(&mut self) -> Option<ConnectivityEvent> {
        self.events.recv().await
    }
}

impl Stream for Subscription {
    type Item = ConnectivityEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

struct Subscriber {
    tx: mpsc::Sender<ConnectivityEvent>,
    /// Latest event not yet delivered because the channel was full.
    owed: Option<ConnectivityEvent>,
}

/// Resolves once a lagging subscriber has room again, or with `None` once it
/// has gone away.
type SlotFuture = BoxFuture<'static, (SubscriberId, Option<OwnedPermit<ConnectivityEvent>>)>;

fn wait_for_slot(id: SubscriberId, tx: mpsc::Sender<ConnectivityEvent>) -> SlotFuture {
    async move { (id, tx.reserve_owned().await.ok()) }.boxed()
}

struct StatusHub {
    requests: mpsc::UnboundedReceiver<HubRequest>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    slots: FuturesUnordered<SlotFuture>,
    current: ConnectivityEvent,
    buffer: usize,
    next_id: u64,
}

impl StatusHub {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                Some((id, permit)) = self.slots.next(), if !self.slots.is_empty() => {
                    self.catch_up(id, permit);
                }
            }
        }
        debug!("status hub stopped");
    }

    fn handle(&mut self, request: HubRequest) {
        match request {
            HubRequest::Register { reply } => self.register(reply),
            HubRequest::Deregister(id) => self.deregister(id),
            HubRequest::Publish(event) => self.publish(event),
            HubRequest::Current { reply } => {
                let _ = reply.send(self.current);
            }
            HubRequest::SubscriberCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn register(
        &mut self,
        reply: oneshot::Sender<(SubscriberId, mpsc::Receiver<ConnectivityEvent>)>,
    ) {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.buffer);
        // Fresh channel with a non-zero buffer: cannot be full.
        let _ = tx.try_send(self.current);

        if reply.send((id, rx)).is_ok() {
            self.subscribers.insert(id, Subscriber { tx, owed: None });
            info!(subscribers = self.subscribers.len(), "status subscriber added");
        }
    }

    fn deregister(&mut self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            info!(subscribers = self.subscribers.len(), "status subscriber removed");
        }
    }

    fn publish(&mut self, event: ConnectivityEvent) {
        self.current = event;
        let slots = &mut self.slots;
        self.subscribers.retain(|id, sub| {
            if sub.owed.is_some() {
                sub.owed = Some(event);
                return true;
            }
            match sub.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id.0, %event, "status subscriber lagging; delivery deferred");
                    sub.owed = Some(event);
                    slots.push(wait_for_slot(*id, sub.tx.clone()));
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        debug!(%event, subscribers = self.subscribers.len(), "connectivity published");
    }

    fn catch_up(&mut self, id: SubscriberId, permit: Option<OwnedPermit<ConnectivityEvent>>) {
        let Some(sub) = self.subscribers.get_mut(&id) else {
            return;
        };
        match (permit, sub.owed.take()) {
            (Some(permit), Some(event)) => {
                permit.send(event);
                debug!(subscriber = id.0, %event, "lagging subscriber caught up");
            }
            (None, _) => {
                self.subscribers.remove(&id);
            }
            (Some(_), None) => {}
        }
    }
}
