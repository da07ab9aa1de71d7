//! Connection protocol: one logical session over many transport incarnations.
//!
//! # Handshake
//! 1. Connect; the server speaks first with `Welcome`
//! 2. Send `Hello` with the client id and last known position
//! 3. Receive `Connected(connection_id)`
//!
//! A `connection_id` equal to the previous one means the server retained
//! the session: every still-pending request is replayed in ascending
//! `reply_to` order before anything newer is transmitted. A different id is
//! a fresh session; requests that were pending cannot be resumed and fail
//! with `ConnectionLost`.
//!
//! All inbound dispatch for one incarnation runs on this task, so handlers
//! observe frames in arrival order; user callbacks are fanned out to
//! spawned tasks by the managers.

use crate::broadcast::BroadcastManager;
use crate::bus::{Completion, Outbound, RequestSender};
use crate::config::ReconnectPolicy;
use crate::error::ClientError;
use crate::services::ServiceManager;
use crate::transport::{self, WsStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sn_protocol::{
    Bye, ConnectionMessage, Hello, MaritimeId, PROTOCOL_VERSION, PositionTime, decode_frame,
    encode_frame,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Why a connect-and-handshake attempt did not produce a session.
#[derive(Debug)]
pub(crate) enum HandshakeError {
    /// The transport never opened. Retryable.
    Connect(String),
    /// The server rejected the handshake (version mismatch, `Bye`, or an
    /// out-of-protocol frame). Not retryable.
    Rejected(String),
    /// The transport dropped or stalled mid-handshake. Retryable on the
    /// reconnect path; the initial `connect()` reports it as a handshake
    /// failure.
    Dropped(String),
}

/// Open a transport and run the handshake, returning the live stream and
/// the server-assigned connection id.
pub(crate) async fn connect_and_handshake(
    url: &str,
    timeout: Duration,
    local_id: &MaritimeId,
    position: Option<PositionTime>,
) -> Result<(WsStream, String), HandshakeError> {
    let mut ws = transport::connect(url, timeout).await.map_err(|e| match e {
        ClientError::ConnectFailed(reason) => HandshakeError::Connect(reason),
        other => HandshakeError::Connect(other.to_string()),
    })?;

    match handshake(&mut ws, timeout, local_id, position).await {
        Ok(connection_id) => Ok((ws, connection_id)),
        Err(e) => {
            let _ = ws.close(None).await;
            Err(e)
        }
    }
}

async fn handshake(
    ws: &mut WsStream,
    timeout: Duration,
    local_id: &MaritimeId,
    position: Option<PositionTime>,
) -> Result<String, HandshakeError> {
    match next_message(ws, timeout).await? {
        ConnectionMessage::Welcome(welcome) => {
            if welcome.protocol_version != PROTOCOL_VERSION {
                return Err(HandshakeError::Rejected(format!(
                    "server speaks protocol v{}, this client v{}",
                    welcome.protocol_version, PROTOCOL_VERSION
                )));
            }
            debug!(server_id = %welcome.server_id, banner = %welcome.banner, "welcome received");
        }
        ConnectionMessage::Bye(bye) => {
            return Err(HandshakeError::Rejected(format!("server said bye: {}", bye.reason)));
        }
        other => {
            return Err(HandshakeError::Rejected(format!(
                "expected welcome, got {:?}",
                other.kind()
            )));
        }
    }

    let hello = ConnectionMessage::Hello(Hello { client_id: local_id.clone(), position });
    ws.send(Message::Text(encode_frame(&hello).into()))
        .await
        .map_err(|e| HandshakeError::Dropped(format!("sending hello: {e}")))?;

    match next_message(ws, timeout).await? {
        ConnectionMessage::Connected(connected) => Ok(connected.connection_id),
        ConnectionMessage::Bye(bye) => {
            Err(HandshakeError::Rejected(format!("server said bye: {}", bye.reason)))
        }
        other => Err(HandshakeError::Rejected(format!(
            "expected connected, got {:?}",
            other.kind()
        ))),
    }
}

/// Next decodable text frame, answering pings, bounded by `timeout`.
async fn next_message(
    ws: &mut WsStream,
    timeout: Duration,
) -> Result<ConnectionMessage, HandshakeError> {
    let deadline = Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| HandshakeError::Dropped("handshake timed out".to_owned()))?;
        match msg {
            None => return Err(HandshakeError::Dropped("closed during handshake".to_owned())),
            Some(Err(e)) => return Err(HandshakeError::Dropped(e.to_string())),
            Some(Ok(Message::Text(text))) => {
                return decode_frame(&text)
                    .map_err(|e| HandshakeError::Rejected(format!("undecodable frame: {e}")));
            }
            Some(Ok(Message::Close(_))) => {
                return Err(HandshakeError::Dropped("closed during handshake".to_owned()));
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Session runner
// ---------------------------------------------------------------------------

/// How the whole session ended.
pub(crate) enum SessionEnd {
    /// `close()` was requested; orderly shutdown.
    Closed,
    /// Unrecoverable error (handshake rejected, retries exhausted).
    Fatal(ClientError),
}

/// Why one incarnation's loop exited.
enum Exit {
    Shutdown,
    /// Transport dropped; pending requests are kept for replay.
    Lost,
    /// A frame could not be decoded; transport closed, pending kept.
    Malformed,
    /// A response matched no issued request; transport closed, pending
    /// failed with `ConnectionLost`.
    Orphan,
}

/// Outcome of dispatching one inbound frame.
enum Dispatch {
    Continue,
    Malformed,
    Orphan,
    PeerBye,
}

pub(crate) struct SessionRunner {
    pub(crate) url: String,
    pub(crate) local_id: MaritimeId,
    pub(crate) reconnect_policy: ReconnectPolicy,
    pub(crate) connect_timeout: Duration,
    pub(crate) keep_alive: Duration,
    pub(crate) sender: RequestSender,
    pub(crate) outbound: mpsc::Receiver<Outbound>,
    pub(crate) services: Arc<ServiceManager>,
    pub(crate) broadcasts: Arc<BroadcastManager>,
    pub(crate) last_position: Arc<Mutex<Option<PositionTime>>>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) reconnects: Arc<AtomicU64>,
}

impl SessionRunner {
    /// Drive the logical session until shutdown or a fatal error. `ws` is
    /// the already-handshaken first incarnation.
    pub(crate) async fn run(mut self, ws: WsStream, connection_id: String) -> SessionEnd {
        let mut current = Some(ws);
        let mut session_id = connection_id;
        let mut resumed = false;

        loop {
            let stream = match current.take() {
                Some(s) => s,
                None => match self.reconnect().await {
                    Ok((s, new_id)) => {
                        if new_id == session_id {
                            info!(connection_id = %new_id, "session resumed");
                            resumed = true;
                        } else {
                            info!(
                                old = %session_id,
                                new = %new_id,
                                "server opened a fresh session, failing unresumable requests"
                            );
                            self.sender.fail_all(&ClientError::ConnectionLost);
                            self.services.clear_invocations();
                            session_id = new_id;
                            resumed = false;
                        }
                        s
                    }
                    Err(end) => return end,
                },
            };

            match self.run_incarnation(stream, resumed).await {
                Exit::Shutdown => return SessionEnd::Closed,
                Exit::Lost => info!("transport lost, reconnecting"),
                Exit::Malformed => warn!("closing transport after malformed frame"),
                Exit::Orphan => {
                    self.sender.fail_all(&ClientError::ConnectionLost);
                    self.services.clear_invocations();
                }
            }
            resumed = false;
        }
    }

    async fn run_incarnation(&mut self, mut ws: WsStream, resumed: bool) -> Exit {
        if *self.shutdown.borrow() {
            return self.shutdown_transport(ws).await;
        }

        // Replay before anything newer goes out. The queue may still hold
        // tokens for the frames replayed here; they are skipped below.
        let mut replayed_through = 0u64;
        if resumed {
            let snapshot = self.sender.replay_snapshot();
            if !snapshot.is_empty() {
                info!(n = snapshot.len(), "replaying pending requests");
            }
            for (id, frame) in snapshot {
                if ws.send(Message::Text(frame.into())).await.is_err() {
                    return Exit::Lost;
                }
                replayed_through = id;
            }
        }

        let mut keep_alive = tokio::time::interval(self.keep_alive);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keep_alive.reset();
        let mut last_sent = Instant::now();

        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return self.shutdown_transport(ws).await;
                    }
                }
                item = self.outbound.recv() => match item {
                    None => return self.shutdown_transport(ws).await,
                    Some(Outbound::Request(id)) => {
                        if id <= replayed_through {
                            continue;
                        }
                        // A missing frame means the request was cancelled
                        // between enqueue and transmit.
                        let Some(frame) = self.sender.frame_for(id) else { continue };
                        if ws.send(Message::Text(frame.into())).await.is_err() {
                            return Exit::Lost;
                        }
                        last_sent = Instant::now();
                    }
                    Some(Outbound::OneWay(frame)) => {
                        if ws.send(Message::Text(frame.into())).await.is_err() {
                            return Exit::Lost;
                        }
                        last_sent = Instant::now();
                    }
                },
                msg = ws.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => return Exit::Lost,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        return Exit::Lost;
                    }
                    Some(Ok(Message::Text(text))) => match self.dispatch(&text) {
                        Dispatch::Continue => {}
                        Dispatch::PeerBye => return Exit::Lost,
                        Dispatch::Malformed => {
                            let _ = ws.close(None).await;
                            return Exit::Malformed;
                        }
                        Dispatch::Orphan => {
                            let _ = ws.close(None).await;
                            return Exit::Orphan;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                },
                _ = keep_alive.tick() => {
                    if last_sent.elapsed() >= self.keep_alive {
                        let frame = encode_frame(&ConnectionMessage::KeepAlive);
                        if ws.send(Message::Text(frame.into())).await.is_err() {
                            return Exit::Lost;
                        }
                        last_sent = Instant::now();
                    }
                }
            }
        }
    }

    async fn shutdown_transport(&mut self, mut ws: WsStream) -> Exit {
        let bye = ConnectionMessage::Bye(Bye { reason: "client closed".to_owned() });
        let _ = ws.send(Message::Text(encode_frame(&bye).into())).await;
        let _ = ws.close(None).await;
        Exit::Shutdown
    }

    /// Route one inbound frame. Runs on the serial connection task; user
    /// callbacks are spawned by the managers, never executed inline.
    fn dispatch(&self, text: &str) -> Dispatch {
        let msg = match decode_frame(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                return Dispatch::Malformed;
            }
        };

        if let Some(ack) = msg.message_ack() {
            return match self.sender.complete(ack, msg) {
                Completion::Completed => Dispatch::Continue,
                Completion::Late => {
                    debug!(message_ack = ack, "response for a finished request, discarding");
                    Dispatch::Continue
                }
                Completion::NeverIssued => {
                    error!(message_ack = ack, "response matches no request ever issued");
                    Dispatch::Orphan
                }
            };
        }

        match msg {
            ConnectionMessage::InvokeService(invoke) => {
                self.services.handle_invoke(invoke);
                Dispatch::Continue
            }
            ConnectionMessage::InvokeServiceAck(ack) => {
                self.services.handle_invoke_ack(ack);
                Dispatch::Continue
            }
            ConnectionMessage::BroadcastDeliver(deliver) => {
                self.broadcasts.handle_deliver(deliver);
                Dispatch::Continue
            }
            ConnectionMessage::BroadcastAck(ack) => {
                self.broadcasts.handle_ack(ack);
                Dispatch::Continue
            }
            ConnectionMessage::Bye(bye) => {
                info!(reason = %bye.reason, "server closed the session");
                Dispatch::PeerBye
            }
            other => {
                warn!(kind = ?other.kind(), "unexpected frame, ignoring");
                Dispatch::Continue
            }
        }
    }

    /// Back-off loop; returns the next incarnation or the session's end.
    async fn reconnect(&mut self) -> Result<(WsStream, String), SessionEnd> {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return Err(SessionEnd::Closed);
            }
            let delay = self.reconnect_policy.delay(attempt);
            debug!(attempt, ?delay, "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return Err(SessionEnd::Closed);
                    }
                }
            }
            attempt = attempt.saturating_add(1);

            let position = *self.last_position.lock();
            match connect_and_handshake(&self.url, self.connect_timeout, &self.local_id, position)
                .await
            {
                Ok((ws, connection_id)) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(attempt, connection_id = %connection_id, "reconnected");
                    return Ok((ws, connection_id));
                }
                Err(HandshakeError::Rejected(reason)) => {
                    error!(%reason, "handshake rejected, giving up");
                    return Err(SessionEnd::Fatal(ClientError::HandshakeFailed(reason)));
                }
                Err(HandshakeError::Connect(e)) | Err(HandshakeError::Dropped(e)) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    if let Some(max) = self.reconnect_policy.max_attempts {
                        if attempt >= max {
                            return Err(SessionEnd::Fatal(ClientError::ConnectFailed(format!(
                                "gave up after {attempt} attempts: {e}"
                            ))));
                        }
                    }
                }
            }
        }
    }
}
