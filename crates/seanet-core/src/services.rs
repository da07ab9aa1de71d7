//! Service registration, discovery, and end-to-end invocation.
//!
//! A service is keyed by its channel: the canonical name of its input
//! payload type, declared once on the [`ServiceInit`] trait. Registration
//! binds a callback locally and announces the channel to the server;
//! invocation routes a payload to a remote provider and resolves when the
//! provider's ack comes back.

use crate::bus::RequestSender;
use crate::error::ClientError;
use crate::future::ConnectionFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sn_protocol::{
    ConnectionMessage, FindService, InvokeService, InvokeServiceAck, MaritimeId, RegisterService,
};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Describes a service by its input payload type.
///
/// `CHANNEL` is the canonical name of the payload type and is the key for
/// register, find, and invoke. `Reply` is what a provider sends back.
pub trait ServiceInit: Serialize + DeserializeOwned + Send + 'static {
    const CHANNEL: &'static str;
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

// ---------------------------------------------------------------------------
// Invocation context (provider side)
// ---------------------------------------------------------------------------

struct ContextInner {
    invocation_id: String,
    caller: MaritimeId,
    sender: RequestSender,
    done: AtomicBool,
}

impl ContextInner {
    fn finish(&self, result: Option<String>, error: Option<String>) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let ack = ConnectionMessage::InvokeServiceAck(InvokeServiceAck {
            invocation_id: self.invocation_id.clone(),
            result,
            error,
        });
        if let Err(e) = self.sender.send_one_way(&ack) {
            warn!(invocation_id = %self.invocation_id, error = %e, "could not send invocation ack");
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // A callback that returns (or panics) without completing still owes
        // the caller an answer.
        self.finish(None, Some("service completed without a result".to_owned()));
    }
}

/// Handed to a service callback; resolves the invocation exactly once.
///
/// The first of `complete` / `fail` wins; later calls are no-ops. If every
/// clone is dropped unresolved, the caller receives a failure ack.
pub struct InvocationContext<R> {
    inner: Arc<ContextInner>,
    _reply: PhantomData<fn(R)>,
}

impl<R> Clone for InvocationContext<R> {
    fn clone(&self) -> Self {
        InvocationContext { inner: Arc::clone(&self.inner), _reply: PhantomData }
    }
}

impl<R: Serialize> InvocationContext<R> {
    /// The id of the invoking peer.
    pub fn caller(&self) -> &MaritimeId {
        &self.inner.caller
    }

    pub fn complete(&self, reply: &R) {
        match serde_json::to_string(reply) {
            Ok(payload) => self.inner.finish(Some(payload), None),
            Err(e) => self.inner.finish(None, Some(format!("reply failed to encode: {e}"))),
        }
    }

    pub fn fail(&self, reason: &str) {
        self.inner.finish(None, Some(reason.to_owned()));
    }
}

// ---------------------------------------------------------------------------
// Registration handle
// ---------------------------------------------------------------------------

/// A locally bound service plus the server's confirmation.
pub struct ServiceRegistration {
    channel: String,
    ack: ConnectionFuture<()>,
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistration {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Block until the server confirms the registration.
    pub async fn await_registered(self, timeout: Duration) -> Result<(), ClientError> {
        self.ack.recv_timeout(timeout).await
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type EndpointHandler = Arc<dyn Fn(Arc<ContextInner>, String) + Send + Sync>;

pub(crate) struct ServiceManager {
    sender: RequestSender,
    local_id: MaritimeId,
    endpoints: RwLock<HashMap<String, EndpointHandler>>,
    /// Pending outgoing invocations: `invocation_id` → `reply_to`. Behind
    /// an `Arc` so cancel hooks can hold it without tying up the manager.
    invocations: Arc<Mutex<HashMap<String, u64>>>,
}

impl ServiceManager {
    pub(crate) fn new(sender: RequestSender, local_id: MaritimeId) -> Self {
        ServiceManager {
            sender,
            local_id,
            endpoints: RwLock::new(HashMap::new()),
            invocations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind `callback` to `S::CHANNEL` and announce it to the server.
    ///
    /// Fails synchronously with `AlreadyRegistered` when the channel is
    /// already bound on this client.
    pub(crate) fn register<S, F>(&self, callback: F) -> Result<ServiceRegistration, ClientError>
    where
        S: ServiceInit,
        F: Fn(InvocationContext<S::Reply>, S) + Send + Sync + 'static,
    {
        let channel = S::CHANNEL;
        {
            let mut endpoints = self.endpoints.write();
            if endpoints.contains_key(channel) {
                return Err(ClientError::AlreadyRegistered(channel.to_owned()));
            }
            let callback = Arc::new(callback);
            let handler: EndpointHandler = Arc::new(move |inner: Arc<ContextInner>, payload| {
                let ctx = InvocationContext { inner, _reply: PhantomData };
                match serde_json::from_str::<S>(&payload) {
                    Ok(msg) => (*callback)(ctx, msg),
                    Err(e) => {
                        warn!(channel = S::CHANNEL, error = %e, "invocation payload failed to decode");
                        ctx.fail(&format!("malformed payload: {e}"));
                    }
                }
            });
            endpoints.insert(channel.to_owned(), handler);
        }

        let request = self.sender.request(|id| {
            ConnectionMessage::RegisterService(RegisterService {
                reply_to: id,
                channel: channel.to_owned(),
            })
        });
        let (id, rx) = match request {
            Ok(pair) => pair,
            Err(e) => {
                self.endpoints.write().remove(channel);
                return Err(e);
            }
        };

        let sender = self.sender.clone();
        let ack = ConnectionFuture::new(rx, |_| Ok(()), move || sender.forget(id));
        Ok(ServiceRegistration { channel: channel.to_owned(), ack })
    }

    /// Send `msg` to the service bound to `S::CHANNEL` on `dst`.
    pub(crate) fn invoke<S: ServiceInit>(
        &self,
        dst: MaritimeId,
        msg: &S,
    ) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        let payload =
            serde_json::to_string(msg).map_err(|e| ClientError::Codec(e.to_string()))?;
        let invocation_id = Uuid::new_v4().simple().to_string();

        let request = self.sender.request(|id| {
            // Recorded under the numbering lock so the ack cannot race the
            // frame onto the wire before the entry exists.
            self.invocations.lock().insert(invocation_id.clone(), id);
            ConnectionMessage::InvokeService(InvokeService {
                reply_to: id,
                src: self.local_id.clone(),
                dst,
                channel: S::CHANNEL.to_owned(),
                payload,
                invocation_id: invocation_id.clone(),
            })
        });
        let (id, rx) = match request {
            Ok(pair) => pair,
            Err(e) => {
                self.invocations.lock().remove(&invocation_id);
                return Err(e);
            }
        };

        let sender = self.sender.clone();
        let cancel_invocation = invocation_id.clone();
        let invocations = Arc::clone(&self.invocations);
        let cancel = move || {
            invocations.lock().remove(&cancel_invocation);
            sender.forget(id);
        };
        Ok(ConnectionFuture::new(rx, decode_invoke_reply::<S>, cancel))
    }

    /// A locator for providers of `S::CHANNEL`.
    pub(crate) fn find<S: ServiceInit>(&self) -> ServiceLocator<S> {
        ServiceLocator { sender: self.sender.clone(), _service: PhantomData }
    }

    // -- inbound, called from the connection task --

    /// Dispatch an inbound invocation to the bound callback on a spawned
    /// task. Unbound channels are answered with an error ack.
    pub(crate) fn handle_invoke(&self, invoke: InvokeService) {
        let handler = self.endpoints.read().get(&invoke.channel).cloned();
        match handler {
            None => {
                warn!(channel = %invoke.channel, "invocation for unbound channel");
                let ack = ConnectionMessage::InvokeServiceAck(InvokeServiceAck {
                    invocation_id: invoke.invocation_id,
                    result: None,
                    error: Some(format!("no service bound to channel {}", invoke.channel)),
                });
                if let Err(e) = self.sender.send_one_way(&ack) {
                    warn!(error = %e, "could not answer unbound invocation");
                }
            }
            Some(handler) => {
                let inner = Arc::new(ContextInner {
                    invocation_id: invoke.invocation_id,
                    caller: invoke.src,
                    sender: self.sender.clone(),
                    done: AtomicBool::new(false),
                });
                let payload = invoke.payload;
                tokio::spawn(async move {
                    (*handler)(inner, payload);
                });
            }
        }
    }

    /// Resolve the pending invocation matching this ack. Unknown ids
    /// (cancelled or timed-out invocations) are discarded silently.
    pub(crate) fn handle_invoke_ack(&self, ack: InvokeServiceAck) {
        let reply_to = self.invocations.lock().remove(&ack.invocation_id);
        match reply_to {
            None => {
                debug!(invocation_id = %ack.invocation_id, "ack for unknown invocation, discarding");
            }
            Some(id) => {
                let _ = self.sender.complete(id, ConnectionMessage::InvokeServiceAck(ack));
            }
        }
    }

    /// Drop the invocation index after unresumable-session failures; the
    /// pending table was already failed by the caller.
    pub(crate) fn clear_invocations(&self) {
        self.invocations.lock().clear();
    }
}

fn decode_invoke_reply<S: ServiceInit>(msg: ConnectionMessage) -> Result<S::Reply, ClientError> {
    match msg {
        ConnectionMessage::InvokeServiceAck(ack) => {
            if let Some(error) = ack.error {
                Err(ClientError::RemoteFailure(error))
            } else if let Some(result) = ack.result {
                serde_json::from_str::<S::Reply>(&result)
                    .map_err(|e| ClientError::Codec(e.to_string()))
            } else {
                Err(ClientError::ProtocolError(
                    "invocation ack carried neither result nor error".to_owned(),
                ))
            }
        }
        other => Err(ClientError::ProtocolError(format!(
            "invocation completed by unexpected {:?}",
            other.kind()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Queries the server for providers of one service channel.
pub struct ServiceLocator<S: ServiceInit> {
    sender: RequestSender,
    _service: PhantomData<fn(S)>,
}

impl<S: ServiceInit> ServiceLocator<S> {
    /// The closest provider, or `NoProvider`.
    pub async fn nearest(&self) -> Result<MaritimeId, ClientError> {
        self.providers(1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::NoProvider(S::CHANNEL.to_owned()))
    }

    /// Up to `max` providers, nearest first.
    pub async fn providers(&self, max: u32) -> Result<Vec<MaritimeId>, ClientError> {
        let (id, rx) = self.sender.request(|id| {
            ConnectionMessage::FindService(FindService {
                reply_to: id,
                channel: S::CHANNEL.to_owned(),
                max,
            })
        })?;
        let sender = self.sender.clone();
        let future = ConnectionFuture::new(
            rx,
            |msg| match msg {
                ConnectionMessage::FindServiceAck(ack) => Ok(ack.providers),
                other => Err(ClientError::ProtocolError(format!(
                    "service lookup completed by unexpected {:?}",
                    other.kind()
                ))),
            },
            move || sender.forget(id),
        );
        future.recv().await
    }
}
