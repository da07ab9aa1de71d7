//! Error kinds surfaced to applications.
//!
//! Each variant is a distinct failure class with its own recovery story;
//! the engine never panics on wire input.

/// Error returned by client operations and futures.
///
/// Cloneable because a single failure (a dropped transport, `close()`) fans
/// out to every future that was pending at the time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Opening the transport failed (refused, unreachable, timed out).
    /// During normal operation this feeds the reconnect back-off.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The Welcome/Hello/Connected exchange was rejected. Fatal: the client
    /// enters the closed state rather than retrying.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer violated the protocol (orphan response, malformed frame).
    /// The transport is closed and reconnect proceeds.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The request cannot complete because its session incarnation is gone
    /// and the server did not retain the session.
    #[error("connection lost")]
    ConnectionLost,

    /// A local wait expired. The request itself stays on the wire; a late
    /// response is discarded.
    #[error("timed out")]
    Timeout,

    /// The server or the remote peer reported a failure for this request.
    #[error("remote failure: {0}")]
    RemoteFailure(String),

    /// A service is already bound to this channel on this client.
    #[error("service already registered on channel {0}")]
    AlreadyRegistered(String),

    /// `nearest()` found no provider for the channel.
    #[error("no provider for channel {0}")]
    NoProvider(String),

    /// The future was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// The outbound queue is full; the frame was not enqueued.
    #[error("outbound queue full")]
    Backpressure,

    /// The client has been closed; no further operations are accepted.
    #[error("client is closed")]
    Closed,

    /// A user payload failed to encode or decode at the trait seam.
    #[error("payload codec error: {0}")]
    Codec(String),
}
