//! Client facade and lifecycle.
//!
//! [`MaritimeClient::connect`] performs the initial connect and handshake,
//! then hands the session to a background task that keeps it alive across
//! transport drops. The public state machine is
//! `Created → Connected → Closed → Terminated`; reconnects do not surface
//! as state changes because the logical session survives them.

use crate::broadcast::{
    BroadcastFuture, BroadcastManager, BroadcastMessage, BroadcastSubscription,
};
use crate::bus::{OUTBOUND_QUEUE_DEPTH, RequestSender};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::future::ConnectionFuture;
use crate::position;
use crate::services::{
    InvocationContext, ServiceInit, ServiceLocator, ServiceManager, ServiceRegistration,
};
use crate::session::{HandshakeError, SessionEnd, SessionRunner};
use crate::transport;
use parking_lot::Mutex;
use sn_protocol::{BroadcastOptions, MaritimeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Lifecycle of one client. `Closed` and `Terminated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Constructed, not yet connected.
    Created,
    /// The logical session is live (possibly mid-reconnect underneath).
    Connected,
    /// Shutdown requested or the session failed fatally; no new work.
    Closed,
    /// All background activity has quiesced.
    Terminated,
}

impl State {
    pub fn is_closed(self) -> bool {
        self >= State::Closed
    }
}

/// Removes a state listener registered with
/// [`MaritimeClient::add_state_listener`].
pub struct StateListenerHandle {
    id: u64,
}

type StateListener = Box<dyn Fn(State) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, StateListener)>,
}

/// State storage: transitions serialized by the listeners mutex, reads
/// lock-free through the watch channel.
struct StateCell {
    tx: watch::Sender<State>,
    listeners: Mutex<Listeners>,
}

impl StateCell {
    /// Apply a forward transition. Backward or repeated transitions are
    /// rejected, which is what makes `close()` idempotent.
    fn advance(&self, to: State) -> bool {
        let listeners = self.listeners.lock();
        let current = *self.tx.borrow();
        if to <= current {
            return false;
        }
        let _ = self.tx.send(to);
        for (_, listener) in &listeners.entries {
            listener(to);
        }
        true
    }
}

struct Shared {
    local_id: MaritimeId,
    default_broadcast_options: BroadcastOptions,
    sender: RequestSender,
    services: Arc<ServiceManager>,
    broadcasts: Arc<BroadcastManager>,
    state: StateCell,
    shutdown: watch::Sender<bool>,
    reconnects: Arc<AtomicU64>,
}

impl Shared {
    fn close(&self) {
        if !self.state.advance(State::Closed) {
            return;
        }
        info!(local_id = %self.local_id, "closing client");
        let _ = self.shutdown.send(true);
        self.sender.close(&ClientError::ConnectionLost);
        self.services.clear_invocations();
        self.broadcasts.clear_tracked();
    }
}

/// A persistent connection to the maritime network.
///
/// Closes itself when dropped; [`MaritimeClient::close`] plus
/// [`MaritimeClient::await_terminated`] is the orderly path.
pub struct MaritimeClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MaritimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaritimeClient")
            .field("local_id", &self.shared.local_id)
            .finish_non_exhaustive()
    }
}

impl MaritimeClient {
    /// Connect and perform the handshake.
    ///
    /// Failures of this initial attempt are reported directly
    /// (`ConnectFailed`, `HandshakeFailed`) and do not trigger reconnect;
    /// the back-off machinery takes over only once a session existed.
    pub async fn connect(config: ClientConfig) -> Result<MaritimeClient, ClientError> {
        config.validate()?;
        let url = transport::build_url(&config.host);
        let supplier = Arc::clone(&config.position_supplier);
        let initial_fix = match (*supplier)() {
            Ok(position) => Some(position),
            Err(reason) => {
                debug!(%reason, "no position for hello");
                None
            }
        };
        let last_position = Arc::new(Mutex::new(initial_fix));

        let (ws, connection_id) = crate::session::connect_and_handshake(
            &url,
            config.connect_timeout,
            &config.local_id,
            initial_fix,
        )
        .await
        .map_err(|e| match e {
            HandshakeError::Connect(msg) => ClientError::ConnectFailed(msg),
            HandshakeError::Rejected(msg) | HandshakeError::Dropped(msg) => {
                ClientError::HandshakeFailed(msg)
            }
        })?;
        info!(local_id = %config.local_id, connection_id = %connection_id, "connected");

        let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let sender = RequestSender::new(queue_tx);
        let services = Arc::new(ServiceManager::new(sender.clone(), config.local_id.clone()));
        let broadcasts = Arc::new(BroadcastManager::new(
            sender.clone(),
            config.local_id.clone(),
            Arc::clone(&last_position),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(State::Created);
        let reconnects = Arc::new(AtomicU64::new(0));

        let shared = Arc::new(Shared {
            local_id: config.local_id.clone(),
            default_broadcast_options: config.default_broadcast_options.clone(),
            sender: sender.clone(),
            services: Arc::clone(&services),
            broadcasts: Arc::clone(&broadcasts),
            state: StateCell { tx: state_tx, listeners: Mutex::new(Listeners::default()) },
            shutdown: shutdown_tx,
            reconnects: Arc::clone(&reconnects),
        });
        shared.state.advance(State::Connected);

        tokio::spawn(position::run_position_task(
            sender.clone(),
            supplier,
            Arc::clone(&last_position),
            config.position_interval,
            shutdown_rx.clone(),
        ));

        let runner = SessionRunner {
            url,
            local_id: config.local_id,
            reconnect_policy: config.reconnect.clone(),
            connect_timeout: config.connect_timeout,
            keep_alive: config.keep_alive_interval,
            sender,
            outbound: queue_rx,
            services,
            broadcasts,
            last_position,
            shutdown: shutdown_rx,
            reconnects,
        };
        let session_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            match runner.run(ws, connection_id).await {
                SessionEnd::Closed => {}
                SessionEnd::Fatal(e) => {
                    error!(error = %e, "session terminated");
                    session_shared.state.advance(State::Closed);
                }
            }
            let _ = session_shared.shutdown.send(true);
            session_shared.sender.close(&ClientError::ConnectionLost);
            session_shared.services.clear_invocations();
            session_shared.broadcasts.clear_tracked();
            session_shared.state.advance(State::Terminated);
        });

        Ok(MaritimeClient { shared })
    }

    pub fn local_id(&self) -> &MaritimeId {
        &self.shared.local_id
    }

    pub fn state(&self) -> State {
        *self.shared.state.tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Completed reconnects since the initial connect.
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// In-flight numbered requests (awaiting a response or replay).
    pub fn pending_request_count(&self) -> usize {
        self.shared.sender.pending_len()
    }

    /// Observe state transitions. The listener runs on whichever task
    /// triggers the transition; keep it brief.
    pub fn add_state_listener(
        &self,
        listener: impl Fn(State) + Send + Sync + 'static,
    ) -> StateListenerHandle {
        let mut listeners = self.shared.state.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Box::new(listener)));
        StateListenerHandle { id }
    }

    pub fn remove_state_listener(&self, handle: StateListenerHandle) {
        let mut listeners = self.shared.state.listeners.lock();
        listeners.entries.retain(|(id, _)| *id != handle.id);
    }

    /// Request shutdown: stops the periodic tasks, says `Bye`, closes the
    /// transport, and fails every pending future with `ConnectionLost`.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Wait until all background activity has quiesced. `true` once the
    /// state reached `Terminated` within `timeout`.
    pub async fn await_terminated(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.state.tx.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow_and_update() == State::Terminated {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    // -- services --

    /// Register a local service on `S::CHANNEL`.
    pub fn service_register<S, F>(&self, callback: F) -> Result<ServiceRegistration, ClientError>
    where
        S: ServiceInit,
        F: Fn(InvocationContext<S::Reply>, S) + Send + Sync + 'static,
    {
        self.shared.services.register::<S, F>(callback)
    }

    /// A locator for remote providers of `S::CHANNEL`.
    pub fn service_find<S: ServiceInit>(&self) -> ServiceLocator<S> {
        self.shared.services.find::<S>()
    }

    /// Invoke the service on `dst`; resolves when the provider answers.
    pub fn service_invoke<S: ServiceInit>(
        &self,
        dst: MaritimeId,
        msg: &S,
    ) -> Result<ConnectionFuture<S::Reply>, ClientError> {
        self.shared.services.invoke::<S>(dst, msg)
    }

    // -- broadcasts --

    /// Publish with the configured default options.
    pub fn broadcast<M: BroadcastMessage>(&self, msg: &M) -> Result<BroadcastFuture, ClientError> {
        self.broadcast_with(msg, self.shared.default_broadcast_options.clone())
    }

    pub fn broadcast_with<M: BroadcastMessage>(
        &self,
        msg: &M,
        options: BroadcastOptions,
    ) -> Result<BroadcastFuture, ClientError> {
        self.shared.broadcasts.send(msg, options)
    }

    /// Subscribe to broadcasts on `M::CHANNEL`.
    pub fn broadcast_listen<M, F>(&self, listener: F) -> BroadcastSubscription
    where
        M: BroadcastMessage,
        F: Fn(crate::broadcast::BroadcastHeader, M) + Send + Sync + 'static,
    {
        self.shared.broadcasts.listen::<M, F>(listener)
    }
}

impl Drop for MaritimeClient {
    fn drop(&mut self) {
        self.shared.close();
    }
}
