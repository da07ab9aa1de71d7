//! Broadcast fan-out and acknowledgement aggregation.
//!
//! Subscriptions are keyed by channel (the canonical name of the payload
//! type). Listener sets are copy-on-write: dispatch iterates a snapshot, so
//! subscribing or cancelling during delivery never blocks the connection
//! task. A sent broadcast is tracked by its `broadcast_id` only while the
//! caller holds the [`BroadcastFuture`]; acks arriving after the future is
//! released are discarded.

use crate::bus::RequestSender;
use crate::error::ClientError;
use crate::future::ConnectionFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sn_protocol::{
    BroadcastAck, BroadcastDeliver, BroadcastOptions, BroadcastSend, ConnectionMessage,
    MaritimeId, PositionTime,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A broadcast payload type, bound to its channel name.
pub trait BroadcastMessage: Serialize + DeserializeOwned + Send + 'static {
    const CHANNEL: &'static str;
}

/// Sender metadata delivered alongside every broadcast payload.
#[derive(Debug, Clone)]
pub struct BroadcastHeader {
    pub src: MaritimeId,
    pub position: Option<PositionTime>,
}

/// One per-recipient receipt for a sent broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastRecipient {
    pub id: MaritimeId,
    pub position: Option<PositionTime>,
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// Membership of one listener in one channel. `cancel` is idempotent;
/// dropping the handle leaves the listener subscribed.
pub struct BroadcastSubscription {
    manager: Weak<BroadcastManager>,
    channel: &'static str,
    id: u64,
}

impl BroadcastSubscription {
    pub fn channel(&self) -> &str {
        self.channel
    }

    pub fn cancel(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_listener(self.channel, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast future
// ---------------------------------------------------------------------------

enum ReceivedState {
    Pending(ConnectionFuture<()>),
    Done(Result<(), ClientError>),
}

/// Multi-stage result of a broadcast send: one server-receipt milestone
/// plus a stream of per-recipient acks.
///
/// Dropping the future releases the ack tracking entry; late acks are then
/// discarded instead of accumulating.
pub struct BroadcastFuture {
    broadcast_id: String,
    received: ReceivedState,
    acks: mpsc::UnboundedReceiver<BroadcastRecipient>,
    manager: Weak<BroadcastManager>,
}

impl BroadcastFuture {
    pub fn broadcast_id(&self) -> &str {
        &self.broadcast_id
    }

    /// Resolves once the server has accepted the broadcast for delivery.
    /// No recipient ack is ever observed before this milestone.
    pub async fn received_on_server(&mut self) -> Result<(), ClientError> {
        let state = std::mem::replace(
            &mut self.received,
            ReceivedState::Done(Err(ClientError::Cancelled)),
        );
        let result = match state {
            ReceivedState::Pending(future) => future.recv().await,
            ReceivedState::Done(result) => result,
        };
        self.received = ReceivedState::Done(result.clone());
        result
    }

    /// The next per-recipient ack, or `None` once the client is closed and
    /// no further acks can arrive.
    pub async fn next_ack(&mut self) -> Option<BroadcastRecipient> {
        self.acks.recv().await
    }
}

impl Drop for BroadcastFuture {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.tracked.lock().remove(&self.broadcast_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type ListenerFn = Arc<dyn Fn(BroadcastHeader, &str) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    listener: ListenerFn,
}

pub(crate) struct BroadcastManager {
    sender: RequestSender,
    local_id: MaritimeId,
    last_position: Arc<Mutex<Option<PositionTime>>>,
    /// Copy-on-write listener sets, snapshot-iterated during dispatch.
    listeners: RwLock<HashMap<String, Arc<Vec<ListenerEntry>>>>,
    next_listener_id: AtomicU64,
    /// Ack routes for broadcasts whose future is still alive.
    tracked: Mutex<HashMap<String, mpsc::UnboundedSender<BroadcastRecipient>>>,
}

impl BroadcastManager {
    pub(crate) fn new(
        sender: RequestSender,
        local_id: MaritimeId,
        last_position: Arc<Mutex<Option<PositionTime>>>,
    ) -> Self {
        BroadcastManager {
            sender,
            local_id,
            last_position,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Add a listener for `M::CHANNEL`. Payloads that fail to decode are
    /// logged and dropped without reaching the listener.
    pub(crate) fn listen<M, F>(self: &Arc<Self>, listener: F) -> BroadcastSubscription
    where
        M: BroadcastMessage,
        F: Fn(BroadcastHeader, M) + Send + Sync + 'static,
    {
        let wrapped: ListenerFn = Arc::new(move |header: BroadcastHeader, payload: &str| {
            match serde_json::from_str::<M>(payload) {
                Ok(msg) => listener(header, msg),
                Err(e) => {
                    warn!(channel = M::CHANNEL, error = %e, "broadcast payload failed to decode, dropping");
                }
            }
        });
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let mut listeners = self.listeners.write();
        let set = listeners.entry(M::CHANNEL.to_owned()).or_default();
        let mut next: Vec<ListenerEntry> = Vec::with_capacity(set.len() + 1);
        next.extend(set.iter().map(|e| ListenerEntry { id: e.id, listener: Arc::clone(&e.listener) }));
        next.push(ListenerEntry { id, listener: wrapped });
        *set = Arc::new(next);

        BroadcastSubscription { manager: Arc::downgrade(self), channel: M::CHANNEL, id }
    }

    fn remove_listener(&self, channel: &str, id: u64) {
        let mut listeners = self.listeners.write();
        let Some(set) = listeners.get_mut(channel) else { return };
        if !set.iter().any(|e| e.id == id) {
            return;
        }
        let next: Vec<ListenerEntry> = set
            .iter()
            .filter(|e| e.id != id)
            .map(|e| ListenerEntry { id: e.id, listener: Arc::clone(&e.listener) })
            .collect();
        if next.is_empty() {
            listeners.remove(channel);
        } else {
            *set = Arc::new(next);
        }
    }

    /// Publish `msg` on `M::CHANNEL` with the given options.
    pub(crate) fn send<M: BroadcastMessage>(
        self: &Arc<Self>,
        msg: &M,
        options: BroadcastOptions,
    ) -> Result<BroadcastFuture, ClientError> {
        let payload =
            serde_json::to_string(msg).map_err(|e| ClientError::Codec(e.to_string()))?;
        let broadcast_id = Uuid::new_v4().simple().to_string();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        self.tracked.lock().insert(broadcast_id.clone(), ack_tx);

        let position = *self.last_position.lock();
        let request = self.sender.request(|id| {
            ConnectionMessage::BroadcastSend(BroadcastSend {
                reply_to: id,
                src: self.local_id.clone(),
                position,
                channel: M::CHANNEL.to_owned(),
                payload,
                options,
                broadcast_id: broadcast_id.clone(),
            })
        });
        let (id, rx) = match request {
            Ok(pair) => pair,
            Err(e) => {
                self.tracked.lock().remove(&broadcast_id);
                return Err(e);
            }
        };

        let sender = self.sender.clone();
        let received = ConnectionFuture::new(rx, |_| Ok(()), move || sender.forget(id));
        Ok(BroadcastFuture {
            broadcast_id,
            received: ReceivedState::Pending(received),
            acks: ack_rx,
            manager: Arc::downgrade(self),
        })
    }

    // -- inbound, called from the connection task --

    /// Fan a delivered broadcast out to the channel's listeners, one
    /// spawned task per listener.
    pub(crate) fn handle_deliver(&self, deliver: BroadcastDeliver) {
        let snapshot = self.listeners.read().get(&deliver.channel).cloned();
        let Some(snapshot) = snapshot else {
            debug!(channel = %deliver.channel, "broadcast for channel without listeners");
            return;
        };
        let header = BroadcastHeader { src: deliver.src, position: deliver.position };
        let payload: Arc<str> = deliver.payload.into();
        for entry in snapshot.iter() {
            let listener = Arc::clone(&entry.listener);
            let header = header.clone();
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                (*listener)(header, &payload);
            });
        }
    }

    /// Route a per-recipient ack to its broadcast future, if it is still
    /// held; otherwise discard.
    pub(crate) fn handle_ack(&self, ack: BroadcastAck) {
        let mut tracked = self.tracked.lock();
        let Some(route) = tracked.get(&ack.broadcast_id) else {
            debug!(broadcast_id = %ack.broadcast_id, "ack for released broadcast, discarding");
            return;
        };
        let recipient = BroadcastRecipient { id: ack.recipient_id, position: ack.recipient_position };
        if route.send(recipient).is_err() {
            tracked.remove(&ack.broadcast_id);
        }
    }

    /// Stop routing acks entirely; used at close.
    pub(crate) fn clear_tracked(&self) {
        self.tracked.lock().clear();
    }
}
