// sn-protocol: wire message types and frame codec for the seanet protocol.
//
// Every frame is a JSON array `[type_id, field1, field2, ...]`. The first
// element is a small integer from a closed set (one per message kind); the
// receiver uses it to choose a decoder. The positional layout is the frozen
// v1 format, so the codec reads and writes fields by index instead of relying
// on derived struct serialization.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

/// Protocol version announced by the server in `Welcome` and expected by
/// clients. A mismatch is a handshake failure.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// MaritimeId
// ---------------------------------------------------------------------------

/// Stable opaque identity of a peer (ship, shore station, server).
///
/// URN-like string, e.g. `mrn:vessel:imo:9074729`. The protocol treats the
/// content as opaque; only non-emptiness and absence of whitespace are
/// enforced so ids survive the text framing unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaritimeId(String);

impl MaritimeId {
    pub fn parse(s: &str) -> Result<Self, InvalidMaritimeId> {
        if s.is_empty() {
            return Err(InvalidMaritimeId::Empty);
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(InvalidMaritimeId::IllegalCharacter);
        }
        Ok(MaritimeId(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MaritimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MaritimeId {
    type Err = InvalidMaritimeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MaritimeId::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidMaritimeId {
    #[error("maritime id must not be empty")]
    Empty,
    #[error("maritime id must not contain whitespace or control characters")]
    IllegalCharacter,
}

// ---------------------------------------------------------------------------
// PositionTime
// ---------------------------------------------------------------------------

/// A (latitude, longitude, timestamp) triple. Immutable.
///
/// Timestamps are milliseconds since the Unix epoch, as reported by the
/// position source; the protocol applies no clock adjustment.
///
/// On the wire a position is a nested array `[lat, lon, timestamp_ms]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionTime {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

impl PositionTime {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        PositionTime { latitude, longitude, timestamp_ms }
    }
}

// ---------------------------------------------------------------------------
// BroadcastOptions
// ---------------------------------------------------------------------------

/// Geographic and delivery options attached to a broadcast send.
///
/// The client forwards these verbatim; only the server interprets them.
/// Serialized as a JSON object inside the frame (the one object-shaped
/// field in the protocol).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Deliver only to peers within this distance of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<u32>,
    /// Server-side retention for late subscribers, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Request a `BroadcastAck` per recipient.
    #[serde(default)]
    pub receipt_required: bool,
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The closed set of frame type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Welcome = 1,
    Hello = 2,
    Connected = 3,
    Bye = 4,
    PositionReport = 5,
    KeepAlive = 6,
    RegisterService = 10,
    RegisterServiceAck = 11,
    FindService = 12,
    FindServiceAck = 13,
    InvokeService = 14,
    InvokeServiceAck = 15,
    BroadcastSend = 16,
    BroadcastSendAck = 17,
    BroadcastDeliver = 18,
    BroadcastAck = 19,
}

impl TryFrom<i64> for MessageKind {
    type Error = FrameError;

    fn try_from(id: i64) -> Result<Self, FrameError> {
        Ok(match id {
            1 => MessageKind::Welcome,
            2 => MessageKind::Hello,
            3 => MessageKind::Connected,
            4 => MessageKind::Bye,
            5 => MessageKind::PositionReport,
            6 => MessageKind::KeepAlive,
            10 => MessageKind::RegisterService,
            11 => MessageKind::RegisterServiceAck,
            12 => MessageKind::FindService,
            13 => MessageKind::FindServiceAck,
            14 => MessageKind::InvokeService,
            15 => MessageKind::InvokeServiceAck,
            16 => MessageKind::BroadcastSend,
            17 => MessageKind::BroadcastSendAck,
            18 => MessageKind::BroadcastDeliver,
            19 => MessageKind::BroadcastAck,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Transport-control messages
// ---------------------------------------------------------------------------

/// First frame on every connection, server-initiated.
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    pub protocol_version: u32,
    pub server_id: MaritimeId,
    pub banner: String,
}

/// Client's reply to `Welcome`.
///
/// `position` is the client's last known position, if any; the server seeds
/// its routing table from it before the first `PositionReport` arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub client_id: MaritimeId,
    pub position: Option<PositionTime>,
}

/// Completes the handshake.
///
/// A `connection_id` the client has not seen before means a fresh session;
/// the previous id means the server retained the session and the client
/// must resume it (replay pending requests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub connection_id: String,
}

/// Orderly shutdown notice, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bye {
    pub reason: String,
}

/// One-way periodic position publication.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub position: PositionTime,
}

// ---------------------------------------------------------------------------
// Server request / response messages
// ---------------------------------------------------------------------------

/// Register a local service under `channel` so the server can route
/// invocations here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterService {
    pub reply_to: u64,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterServiceAck {
    pub message_ack: u64,
}

/// Look up providers of `channel`, at most `max`, nearest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindService {
    pub reply_to: u64,
    pub channel: String,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindServiceAck {
    pub message_ack: u64,
    /// Provider ids sorted by distance from the requester, nearest first.
    pub providers: Vec<MaritimeId>,
}

// ---------------------------------------------------------------------------
// Client-to-client messages
// ---------------------------------------------------------------------------

/// Invoke a service on a remote peer.
///
/// Carries both correlation planes: `reply_to` numbers the frame like any
/// client-to-server request (so it is tracked and replayed across
/// reconnects), while `invocation_id` correlates the end-to-end result,
/// which comes back from the remote peer as `InvokeServiceAck`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeService {
    pub reply_to: u64,
    pub src: MaritimeId,
    pub dst: MaritimeId,
    pub channel: String,
    /// Serialized service payload; opaque to the protocol.
    pub payload: String,
    /// Random 128-bit hex string, unique per invocation.
    pub invocation_id: String,
}

/// Result of a remote invocation, routed back to the invoker.
///
/// Exactly one of `result` / `error` is set. Correlated by `invocation_id`
/// only — an ack for an unknown invocation (cancelled, timed out) is
/// discarded, not a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeServiceAck {
    pub invocation_id: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Publish a broadcast on `channel`.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastSend {
    pub reply_to: u64,
    pub src: MaritimeId,
    pub position: Option<PositionTime>,
    pub channel: String,
    /// Serialized broadcast payload; opaque to the protocol.
    pub payload: String,
    pub options: BroadcastOptions,
    /// Random 128-bit hex string keying per-recipient acks.
    pub broadcast_id: String,
}

/// Server receipt of a `BroadcastSend`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSendAck {
    pub message_ack: u64,
    pub broadcast_id: String,
}

/// A broadcast delivered to a subscribed peer.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastDeliver {
    pub src: MaritimeId,
    pub position: Option<PositionTime>,
    pub channel: String,
    pub payload: String,
}

/// Per-recipient receipt, relayed to the sender when the broadcast was sent
/// with `receipt_required`.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastAck {
    pub broadcast_id: String,
    pub recipient_id: MaritimeId,
    pub recipient_position: Option<PositionTime>,
}

// ---------------------------------------------------------------------------
// Top-level message enum
// ---------------------------------------------------------------------------

/// All frame kinds in the v1 protocol. Dispatch by `match` on the variant
/// (or on [`ConnectionMessage::kind`] where only the tag matters).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionMessage {
    Welcome(Welcome),
    Hello(Hello),
    Connected(Connected),
    Bye(Bye),
    PositionReport(PositionReport),
    KeepAlive,
    RegisterService(RegisterService),
    RegisterServiceAck(RegisterServiceAck),
    FindService(FindService),
    FindServiceAck(FindServiceAck),
    InvokeService(InvokeService),
    InvokeServiceAck(InvokeServiceAck),
    BroadcastSend(BroadcastSend),
    BroadcastSendAck(BroadcastSendAck),
    BroadcastDeliver(BroadcastDeliver),
    BroadcastAck(BroadcastAck),
}

impl ConnectionMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ConnectionMessage::Welcome(_) => MessageKind::Welcome,
            ConnectionMessage::Hello(_) => MessageKind::Hello,
            ConnectionMessage::Connected(_) => MessageKind::Connected,
            ConnectionMessage::Bye(_) => MessageKind::Bye,
            ConnectionMessage::PositionReport(_) => MessageKind::PositionReport,
            ConnectionMessage::KeepAlive => MessageKind::KeepAlive,
            ConnectionMessage::RegisterService(_) => MessageKind::RegisterService,
            ConnectionMessage::RegisterServiceAck(_) => MessageKind::RegisterServiceAck,
            ConnectionMessage::FindService(_) => MessageKind::FindService,
            ConnectionMessage::FindServiceAck(_) => MessageKind::FindServiceAck,
            ConnectionMessage::InvokeService(_) => MessageKind::InvokeService,
            ConnectionMessage::InvokeServiceAck(_) => MessageKind::InvokeServiceAck,
            ConnectionMessage::BroadcastSend(_) => MessageKind::BroadcastSend,
            ConnectionMessage::BroadcastSendAck(_) => MessageKind::BroadcastSendAck,
            ConnectionMessage::BroadcastDeliver(_) => MessageKind::BroadcastDeliver,
            ConnectionMessage::BroadcastAck(_) => MessageKind::BroadcastAck,
        }
    }

    /// The client-assigned request number, for request kinds.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            ConnectionMessage::RegisterService(m) => Some(m.reply_to),
            ConnectionMessage::FindService(m) => Some(m.reply_to),
            ConnectionMessage::InvokeService(m) => Some(m.reply_to),
            ConnectionMessage::BroadcastSend(m) => Some(m.reply_to),
            _ => None,
        }
    }

    /// The echoed request number, for server response kinds.
    pub fn message_ack(&self) -> Option<u64> {
        match self {
            ConnectionMessage::RegisterServiceAck(m) => Some(m.message_ack),
            ConnectionMessage::FindServiceAck(m) => Some(m.message_ack),
            ConnectionMessage::BroadcastSendAck(m) => Some(m.message_ack),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("frame array is empty")]
    EmptyFrame,
    #[error("frame type id is not an integer")]
    KindNotAnInteger,
    #[error("unknown frame type id {0}")]
    UnknownKind(i64),
    #[error("frame field {index}: expected {expected}")]
    Field { index: usize, expected: &'static str },
    #[error("frame field {1}: {0}")]
    Id(InvalidMaritimeId, usize),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn pos_value(p: &PositionTime) -> Value {
    json!([p.latitude, p.longitude, p.timestamp_ms])
}

fn opt_pos_value(p: &Option<PositionTime>) -> Value {
    match p {
        Some(p) => pos_value(p),
        None => Value::Null,
    }
}

/// Serialize a message into its text frame.
pub fn encode_frame(msg: &ConnectionMessage) -> String {
    let frame = match msg {
        ConnectionMessage::Welcome(m) => {
            json!([1, m.protocol_version, m.server_id, m.banner])
        }
        ConnectionMessage::Hello(m) => {
            json!([2, m.client_id, opt_pos_value(&m.position)])
        }
        ConnectionMessage::Connected(m) => json!([3, m.connection_id]),
        ConnectionMessage::Bye(m) => json!([4, m.reason]),
        ConnectionMessage::PositionReport(m) => json!([5, pos_value(&m.position)]),
        ConnectionMessage::KeepAlive => json!([6]),
        ConnectionMessage::RegisterService(m) => json!([10, m.reply_to, m.channel]),
        ConnectionMessage::RegisterServiceAck(m) => json!([11, m.message_ack]),
        ConnectionMessage::FindService(m) => json!([12, m.reply_to, m.channel, m.max]),
        ConnectionMessage::FindServiceAck(m) => json!([13, m.message_ack, m.providers]),
        ConnectionMessage::InvokeService(m) => {
            json!([14, m.reply_to, m.src, m.dst, m.channel, m.payload, m.invocation_id])
        }
        ConnectionMessage::InvokeServiceAck(m) => {
            json!([15, m.invocation_id, m.result, m.error])
        }
        ConnectionMessage::BroadcastSend(m) => json!([
            16,
            m.reply_to,
            m.src,
            opt_pos_value(&m.position),
            m.channel,
            m.payload,
            m.options,
            m.broadcast_id
        ]),
        ConnectionMessage::BroadcastSendAck(m) => json!([17, m.message_ack, m.broadcast_id]),
        ConnectionMessage::BroadcastDeliver(m) => {
            json!([18, m.src, opt_pos_value(&m.position), m.channel, m.payload])
        }
        ConnectionMessage::BroadcastAck(m) => json!([
            19,
            m.broadcast_id,
            m.recipient_id,
            opt_pos_value(&m.recipient_position)
        ]),
    };
    frame.to_string()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Positional field reader over a decoded frame array.
struct Fields<'a> {
    values: &'a [Value],
}

impl<'a> Fields<'a> {
    fn get(&self, index: usize) -> Result<&'a Value, FrameError> {
        self.values
            .get(index)
            .ok_or(FrameError::Field { index, expected: "value" })
    }

    fn str_at(&self, index: usize) -> Result<&'a str, FrameError> {
        self.get(index)?
            .as_str()
            .ok_or(FrameError::Field { index, expected: "string" })
    }

    fn string_at(&self, index: usize) -> Result<String, FrameError> {
        Ok(self.str_at(index)?.to_owned())
    }

    fn u64_at(&self, index: usize) -> Result<u64, FrameError> {
        self.get(index)?
            .as_u64()
            .ok_or(FrameError::Field { index, expected: "unsigned integer" })
    }

    fn u32_at(&self, index: usize) -> Result<u32, FrameError> {
        let n = self.u64_at(index)?;
        u32::try_from(n).map_err(|_| FrameError::Field { index, expected: "32-bit unsigned integer" })
    }

    fn opt_string_at(&self, index: usize) -> Result<Option<String>, FrameError> {
        match self.get(index)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(FrameError::Field { index, expected: "string or null" }),
        }
    }

    fn id_at(&self, index: usize) -> Result<MaritimeId, FrameError> {
        MaritimeId::parse(self.str_at(index)?).map_err(|e| FrameError::Id(e, index))
    }

    fn ids_at(&self, index: usize) -> Result<Vec<MaritimeId>, FrameError> {
        let arr = self
            .get(index)?
            .as_array()
            .ok_or(FrameError::Field { index, expected: "array of ids" })?;
        arr.iter()
            .map(|v| {
                let s = v
                    .as_str()
                    .ok_or(FrameError::Field { index, expected: "array of strings" })?;
                MaritimeId::parse(s).map_err(|e| FrameError::Id(e, index))
            })
            .collect()
    }

    fn pos_at(&self, index: usize) -> Result<PositionTime, FrameError> {
        let arr = self
            .get(index)?
            .as_array()
            .ok_or(FrameError::Field { index, expected: "position array" })?;
        let expected = "position [lat, lon, timestamp_ms]";
        if arr.len() != 3 {
            return Err(FrameError::Field { index, expected });
        }
        let lat = arr[0].as_f64().ok_or(FrameError::Field { index, expected })?;
        let lon = arr[1].as_f64().ok_or(FrameError::Field { index, expected })?;
        let ts = arr[2].as_i64().ok_or(FrameError::Field { index, expected })?;
        Ok(PositionTime::new(lat, lon, ts))
    }

    fn opt_pos_at(&self, index: usize) -> Result<Option<PositionTime>, FrameError> {
        match self.get(index)? {
            Value::Null => Ok(None),
            _ => Ok(Some(self.pos_at(index)?)),
        }
    }

    fn options_at(&self, index: usize) -> Result<BroadcastOptions, FrameError> {
        serde_json::from_value(self.get(index)?.clone())
            .map_err(|_| FrameError::Field { index, expected: "broadcast options object" })
    }
}

/// Parse a text frame into a message.
pub fn decode_frame(text: &str) -> Result<ConnectionMessage, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let array = value.as_array().ok_or(FrameError::NotAnArray)?;
    let tag = array.first().ok_or(FrameError::EmptyFrame)?;
    let kind = MessageKind::try_from(tag.as_i64().ok_or(FrameError::KindNotAnInteger)?)?;
    let f = Fields { values: array };

    Ok(match kind {
        MessageKind::Welcome => ConnectionMessage::Welcome(Welcome {
            protocol_version: f.u32_at(1)?,
            server_id: f.id_at(2)?,
            banner: f.string_at(3)?,
        }),
        MessageKind::Hello => ConnectionMessage::Hello(Hello {
            client_id: f.id_at(1)?,
            position: f.opt_pos_at(2)?,
        }),
        MessageKind::Connected => ConnectionMessage::Connected(Connected {
            connection_id: f.string_at(1)?,
        }),
        MessageKind::Bye => ConnectionMessage::Bye(Bye { reason: f.string_at(1)? }),
        MessageKind::PositionReport => {
            ConnectionMessage::PositionReport(PositionReport { position: f.pos_at(1)? })
        }
        MessageKind::KeepAlive => ConnectionMessage::KeepAlive,
        MessageKind::RegisterService => ConnectionMessage::RegisterService(RegisterService {
            reply_to: f.u64_at(1)?,
            channel: f.string_at(2)?,
        }),
        MessageKind::RegisterServiceAck => {
            ConnectionMessage::RegisterServiceAck(RegisterServiceAck { message_ack: f.u64_at(1)? })
        }
        MessageKind::FindService => ConnectionMessage::FindService(FindService {
            reply_to: f.u64_at(1)?,
            channel: f.string_at(2)?,
            max: f.u32_at(3)?,
        }),
        MessageKind::FindServiceAck => ConnectionMessage::FindServiceAck(FindServiceAck {
            message_ack: f.u64_at(1)?,
            providers: f.ids_at(2)?,
        }),
        MessageKind::InvokeService => ConnectionMessage::InvokeService(InvokeService {
            reply_to: f.u64_at(1)?,
            src: f.id_at(2)?,
            dst: f.id_at(3)?,
            channel: f.string_at(4)?,
            payload: f.string_at(5)?,
            invocation_id: f.string_at(6)?,
        }),
        MessageKind::InvokeServiceAck => ConnectionMessage::InvokeServiceAck(InvokeServiceAck {
            invocation_id: f.string_at(1)?,
            result: f.opt_string_at(2)?,
            error: f.opt_string_at(3)?,
        }),
        MessageKind::BroadcastSend => ConnectionMessage::BroadcastSend(BroadcastSend {
            reply_to: f.u64_at(1)?,
            src: f.id_at(2)?,
            position: f.opt_pos_at(3)?,
            channel: f.string_at(4)?,
            payload: f.string_at(5)?,
            options: f.options_at(6)?,
            broadcast_id: f.string_at(7)?,
        }),
        MessageKind::BroadcastSendAck => ConnectionMessage::BroadcastSendAck(BroadcastSendAck {
            message_ack: f.u64_at(1)?,
            broadcast_id: f.string_at(2)?,
        }),
        MessageKind::BroadcastDeliver => ConnectionMessage::BroadcastDeliver(BroadcastDeliver {
            src: f.id_at(1)?,
            position: f.opt_pos_at(2)?,
            channel: f.string_at(3)?,
            payload: f.string_at(4)?,
        }),
        MessageKind::BroadcastAck => ConnectionMessage::BroadcastAck(BroadcastAck {
            broadcast_id: f.string_at(1)?,
            recipient_id: f.id_at(2)?,
            recipient_position: f.opt_pos_at(3)?,
        }),
    })
}
