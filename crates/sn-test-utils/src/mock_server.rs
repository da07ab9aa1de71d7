// mock_server: An in-process seanet server for testing clients.
//
// Accepts connections on ws://127.0.0.1:<port>, speaks the v1 handshake
// (Welcome -> Hello -> Connected), and implements enough routing for
// end-to-end tests: service registration/lookup, invocation routing between
// connected clients, broadcast fan-out with per-recipient receipts, and
// session retention so a reconnecting client resumes its session and can
// replay pending requests.
//
// Duplicate suppression mirrors the production server's contract: numbered
// requests are deduplicated per session by `reply_to` (the cached response
// is re-sent), invocations by `invocation_id` (a cached ack is re-sent).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sn_protocol::*;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

// ---------------------------------------------------------------------------
// Session bookkeeping
// ---------------------------------------------------------------------------

struct SessionRec {
    connection_id: String,
    position: Option<PositionTime>,
    online: bool,
    outbox: mpsc::UnboundedSender<Message>,
    /// Frames addressed to this client while its socket was down; flushed
    /// on the next successful handshake.
    buffered: Vec<Message>,
    /// `reply_to` -> cached response frame, for duplicate suppression.
    seen_requests: HashMap<u64, String>,
}

struct InvocationRec {
    src: MaritimeId,
    ack_frame: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<MaritimeId, SessionRec>,
    /// channel -> providers in registration order.
    services: HashMap<String, Vec<MaritimeId>>,
    invocations: HashMap<String, InvocationRec>,
    /// Every numbered request received, in arrival order (replays
    /// included). Lets tests assert replay ordering and uniqueness.
    request_log: Vec<(MaritimeId, u64)>,
}

struct ServerState {
    server_id: MaritimeId,
    accepted: AtomicUsize,
    keep_alives: AtomicUsize,
    /// When false, every handshake gets a fresh connection id (the
    /// "server did not retain the session" path).
    resume_sessions: AtomicBool,
    /// When true, the server closes right after Welcome — before
    /// Connected — to exercise handshake failure handling.
    drop_after_welcome: AtomicBool,
    inner: Mutex<Inner>,
}

/// An in-process seanet server bound to a random port.
pub struct MockSeaServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockSeaServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            server_id: MaritimeId::parse("mrn:server:mock").expect("static id"),
            accepted: AtomicUsize::new(0),
            keep_alives: AtomicUsize::new(0),
            resume_sessions: AtomicBool::new(true),
            drop_after_welcome: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let _ = handle_connection(state, stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, state, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    // -- observation --

    /// Total connections ever accepted (handshaken or not).
    pub fn connections_seen(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Keep-alive frames received across all sessions.
    pub fn keep_alives_seen(&self) -> usize {
        self.state.keep_alives.load(Ordering::SeqCst)
    }

    /// Clients whose socket is currently up.
    pub fn connection_count(&self) -> usize {
        self.state.inner.lock().sessions.values().filter(|s| s.online).count()
    }

    /// Channels with at least one registered provider.
    pub fn registered_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> =
            self.state.inner.lock().services.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// `reply_to` values received from `client`, in arrival order, replays
    /// included.
    pub fn request_log(&self, client: &MaritimeId) -> Vec<u64> {
        self.state
            .inner
            .lock()
            .request_log
            .iter()
            .filter(|(id, _)| id == client)
            .map(|(_, reply_to)| *reply_to)
            .collect()
    }

    /// The last position the server learned for `client` (from Hello or
    /// position reports).
    pub fn position_of(&self, client: &MaritimeId) -> Option<PositionTime> {
        self.state.inner.lock().sessions.get(client).and_then(|rec| rec.position)
    }

    // -- chaos hooks --

    /// Close every live socket. Clients observe a transport loss and
    /// reconnect; sessions are retained.
    pub fn drop_connections(&self) {
        let inner = self.state.inner.lock();
        for rec in inner.sessions.values() {
            if rec.online {
                let _ = rec.outbox.send(Message::Close(None));
            }
        }
    }

    /// Hand out a fresh connection id on every handshake instead of
    /// resuming.
    pub fn set_resume_sessions(&self, resume: bool) {
        self.state.resume_sessions.store(resume, Ordering::SeqCst);
    }

    /// Close each new connection right after Welcome, before Connected.
    pub fn set_drop_after_welcome(&self, drop: bool) {
        self.state.drop_after_welcome.store(drop, Ordering::SeqCst);
    }

    /// Push a raw text frame to a connected client, bypassing all protocol
    /// logic. Used to inject out-of-protocol frames (e.g. orphan acks).
    pub fn inject_frame(&self, to: &MaritimeId, frame: &str) {
        let mut inner = self.state.inner.lock();
        send_frame(&mut inner, to, frame.to_owned());
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    state: Arc<ServerState>,
    stream: tokio::net::TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    // Server speaks first.
    let welcome = ConnectionMessage::Welcome(Welcome {
        protocol_version: PROTOCOL_VERSION,
        server_id: state.server_id.clone(),
        banner: "seanet mock relay".to_owned(),
    });
    write.send(Message::Text(encode_frame(&welcome).into())).await?;

    if state.drop_after_welcome.load(Ordering::SeqCst) {
        let _ = write.send(Message::Close(None)).await;
        return Ok(());
    }

    // Expect Hello.
    let hello = loop {
        match read.next().await {
            None => return Ok(()),
            Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                Ok(ConnectionMessage::Hello(hello)) => break hello,
                Ok(_) | Err(_) => {
                    let bye = ConnectionMessage::Bye(Bye {
                        reason: "expected hello".to_owned(),
                    });
                    let _ = write.send(Message::Text(encode_frame(&bye).into())).await;
                    return Ok(());
                }
            },
            Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(_)) => return Ok(()),
        }
    };

    let client_id = hello.client_id.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Bind (or resume) the session and flush anything buffered.
    let connection_id = {
        let mut inner = state.inner.lock();
        let resume = state.resume_sessions.load(Ordering::SeqCst);
        let rec = inner.sessions.entry(client_id.clone()).or_insert_with(|| SessionRec {
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            position: hello.position,
            online: false,
            outbox: tx.clone(),
            buffered: Vec::new(),
            seen_requests: HashMap::new(),
        });
        if !resume {
            rec.connection_id = uuid::Uuid::new_v4().simple().to_string();
            rec.buffered.clear();
            rec.seen_requests.clear();
        }
        if let Some(position) = hello.position {
            rec.position = Some(position);
        }
        rec.online = true;
        rec.outbox = tx.clone();
        for frame in rec.buffered.drain(..) {
            let _ = tx.send(frame);
        }
        rec.connection_id.clone()
    };

    // Writer: single owner of the sink.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    let connected = ConnectionMessage::Connected(Connected { connection_id });
    let _ = tx.send(Message::Text(encode_frame(&connected).into()));

    // Reader loop.
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
                continue;
            }
            Ok(_) => continue,
        };
        match decode_frame(&text) {
            Ok(ConnectionMessage::Bye(_)) => break,
            Ok(msg) => handle_frame(&state, &client_id, msg),
            Err(_) => {}
        }
    }

    // Mark offline only if a newer connection has not already replaced us.
    {
        let mut inner = state.inner.lock();
        if let Some(rec) = inner.sessions.get_mut(&client_id) {
            if rec.outbox.same_channel(&tx) {
                rec.online = false;
            }
        }
    }
    drop(tx);
    writer.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// Protocol logic
// ---------------------------------------------------------------------------

fn handle_frame(state: &ServerState, client: &MaritimeId, msg: ConnectionMessage) {
    if let Some(reply_to) = msg.reply_to() {
        state.inner.lock().request_log.push((client.clone(), reply_to));
    }
    match msg {
        ConnectionMessage::RegisterService(register) => {
            respond_once(state, client, register.reply_to, |inner| {
                let providers = inner.services.entry(register.channel.clone()).or_default();
                if !providers.contains(client) {
                    providers.push(client.clone());
                }
                encode_frame(&ConnectionMessage::RegisterServiceAck(RegisterServiceAck {
                    message_ack: register.reply_to,
                }))
            });
        }
        ConnectionMessage::FindService(find) => {
            respond_once(state, client, find.reply_to, |inner| {
                let providers = nearest_providers(inner, client, &find.channel, find.max);
                encode_frame(&ConnectionMessage::FindServiceAck(FindServiceAck {
                    message_ack: find.reply_to,
                    providers,
                }))
            });
        }
        ConnectionMessage::InvokeService(invoke) => handle_invoke(state, client, invoke),
        ConnectionMessage::InvokeServiceAck(ack) => {
            let mut inner = state.inner.lock();
            let frame = encode_frame(&ConnectionMessage::InvokeServiceAck(ack.clone()));
            let src = match inner.invocations.get_mut(&ack.invocation_id) {
                Some(rec) => {
                    rec.ack_frame = Some(frame.clone());
                    Some(rec.src.clone())
                }
                None => None,
            };
            if let Some(src) = src {
                send_frame(&mut inner, &src, frame);
            }
        }
        ConnectionMessage::BroadcastSend(send) => handle_broadcast(state, client, send),
        ConnectionMessage::PositionReport(report) => {
            let mut inner = state.inner.lock();
            if let Some(rec) = inner.sessions.get_mut(client) {
                rec.position = Some(report.position);
            }
        }
        ConnectionMessage::KeepAlive => {
            state.keep_alives.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    }
}

fn handle_invoke(state: &ServerState, client: &MaritimeId, invoke: InvokeService) {
    let mut inner = state.inner.lock();
    if let Some(seen) = inner
        .invocations
        .get(&invoke.invocation_id)
        .map(|rec| (rec.src.clone(), rec.ack_frame.clone()))
    {
        // Replayed invocation: re-send the cached ack if the provider has
        // already answered; otherwise the answer is still in flight.
        let (src, ack_frame) = seen;
        if let Some(frame) = ack_frame {
            send_frame(&mut inner, &src, frame);
        }
        return;
    }

    if !inner.sessions.contains_key(&invoke.dst) {
        let nack = encode_frame(&ConnectionMessage::InvokeServiceAck(InvokeServiceAck {
            invocation_id: invoke.invocation_id,
            result: None,
            error: Some(format!("unknown destination {}", invoke.dst)),
        }));
        send_frame(&mut inner, client, nack);
        return;
    }

    inner.invocations.insert(
        invoke.invocation_id.clone(),
        InvocationRec { src: client.clone(), ack_frame: None },
    );
    let dst = invoke.dst.clone();
    let frame = encode_frame(&ConnectionMessage::InvokeService(invoke));
    send_frame(&mut inner, &dst, frame);
}

fn handle_broadcast(state: &ServerState, client: &MaritimeId, send: BroadcastSend) {
    let mut inner = state.inner.lock();
    let already_seen = inner
        .sessions
        .get(client)
        .is_some_and(|rec| rec.seen_requests.contains_key(&send.reply_to));

    let ack = encode_frame(&ConnectionMessage::BroadcastSendAck(BroadcastSendAck {
        message_ack: send.reply_to,
        broadcast_id: send.broadcast_id.clone(),
    }));
    if already_seen {
        // Replayed send: acknowledge again, do not deliver twice.
        send_frame(&mut inner, client, ack);
        return;
    }
    if let Some(rec) = inner.sessions.get_mut(client) {
        rec.seen_requests.insert(send.reply_to, ack.clone());
    }
    // Receipt before any per-recipient ack.
    send_frame(&mut inner, client, ack);

    let deliver = encode_frame(&ConnectionMessage::BroadcastDeliver(BroadcastDeliver {
        src: send.src.clone(),
        position: send.position,
        channel: send.channel.clone(),
        payload: send.payload.clone(),
    }));
    let recipients: Vec<(MaritimeId, Option<PositionTime>)> = inner
        .sessions
        .iter()
        .filter(|(id, _)| *id != client)
        .map(|(id, rec)| ((*id).clone(), rec.position))
        .collect();
    for (recipient, position) in recipients {
        send_frame(&mut inner, &recipient, deliver.clone());
        if send.options.receipt_required {
            let receipt = encode_frame(&ConnectionMessage::BroadcastAck(BroadcastAck {
                broadcast_id: send.broadcast_id.clone(),
                recipient_id: recipient.clone(),
                recipient_position: position,
            }));
            send_frame(&mut inner, client, receipt);
        }
    }
}

/// Run `make` once per (session, reply_to); duplicates re-send the cached
/// response without repeating side effects.
fn respond_once(
    state: &ServerState,
    client: &MaritimeId,
    reply_to: u64,
    make: impl FnOnce(&mut Inner) -> String,
) {
    let mut inner = state.inner.lock();
    let cached = inner
        .sessions
        .get(client)
        .and_then(|rec| rec.seen_requests.get(&reply_to).cloned());
    let frame = match cached {
        Some(frame) => frame,
        None => {
            let frame = make(&mut inner);
            if let Some(rec) = inner.sessions.get_mut(client) {
                rec.seen_requests.insert(reply_to, frame.clone());
            }
            frame
        }
    };
    send_frame(&mut inner, client, frame);
}

/// Deliver a frame to a session, buffering while its socket is down.
fn send_frame(inner: &mut Inner, to: &MaritimeId, frame: String) {
    let Some(rec) = inner.sessions.get_mut(to) else { return };
    let msg = Message::Text(frame.into());
    if rec.online {
        if let Err(unsent) = rec.outbox.send(msg) {
            rec.online = false;
            rec.buffered.push(unsent.0);
        }
    } else {
        rec.buffered.push(msg);
    }
}

/// Providers of `channel` ordered by distance from the requester; peers
/// without a known position sort last.
fn nearest_providers(
    inner: &Inner,
    requester: &MaritimeId,
    channel: &str,
    max: u32,
) -> Vec<MaritimeId> {
    let Some(providers) = inner.services.get(channel) else { return Vec::new() };
    let origin = inner.sessions.get(requester).and_then(|rec| rec.position);
    let mut ranked: Vec<(f64, MaritimeId)> = providers
        .iter()
        .map(|id| {
            let position = inner.sessions.get(id).and_then(|rec| rec.position);
            let distance = match (origin, position) {
                (Some(a), Some(b)) => {
                    let dlat = a.latitude - b.latitude;
                    let dlon = a.longitude - b.longitude;
                    dlat * dlat + dlon * dlon
                }
                _ => f64::MAX,
            };
            (distance, id.clone())
        })
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked.into_iter().take(max as usize).map(|(_, id)| id).collect()
}
