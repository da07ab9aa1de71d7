//! Single-shot result slots for in-flight requests.
//!
//! A [`ConnectionFuture`] is the caller's handle to one numbered request:
//! it completes once (result, failure, or cancellation) and is consumed by
//! whichever transition happens first. Cancellation removes the request
//! from the pending table without any wire effect; a response that arrives
//! afterwards is discarded.

use crate::error::ClientError;
use sn_protocol::ConnectionMessage;
use std::time::Duration;
use tokio::sync::oneshot;

/// The completing half stored in the pending table.
pub(crate) type Completer = oneshot::Sender<Result<ConnectionMessage, ClientError>>;
pub(crate) type CompletionRx = oneshot::Receiver<Result<ConnectionMessage, ClientError>>;

/// A single-shot, cancellable result.
///
/// The raw completion value is the protocol message that resolved the
/// request; `map` turns it into the caller-facing type exactly once.
pub struct ConnectionFuture<T> {
    rx: CompletionRx,
    map: Box<dyn FnOnce(ConnectionMessage) -> Result<T, ClientError> + Send>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> ConnectionFuture<T> {
    pub(crate) fn new(
        rx: CompletionRx,
        map: impl FnOnce(ConnectionMessage) -> Result<T, ClientError> + Send + 'static,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        ConnectionFuture {
            rx,
            map: Box::new(map),
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Wait for the result.
    ///
    /// `ConnectionLost` when the engine dropped the completer without
    /// resolving it (shutdown races).
    pub async fn recv(self) -> Result<T, ClientError> {
        match self.rx.await {
            Ok(Ok(msg)) => (self.map)(msg),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::ConnectionLost),
        }
    }

    /// Wait at most `timeout`.
    ///
    /// Expiry fails locally with `Timeout`; the request stays on the wire
    /// and the eventual response is discarded.
    pub async fn recv_timeout(self, timeout: Duration) -> Result<T, ClientError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Abandon the request: the pending entry is removed, no cancel frame is
    /// sent, and no completion can ever be observed through this handle.
    pub fn cancel(mut self) {
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}
