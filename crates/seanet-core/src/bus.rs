//! Outbound numbering and request/response correlation.
//!
//! Every client-to-server request gets a 64-bit `reply_to`, strictly
//! increasing for the life of the process. Assignment, recording in the
//! pending table, and enqueueing happen under one lock so the server
//! observes requests in id order. The pending table doubles as the replay
//! source: after a session resume, entries are retransmitted in ascending
//! id order before anything newer.

use crate::error::ClientError;
use crate::future::Completer;
use sn_protocol::{ConnectionMessage, encode_frame};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Depth of the queue between request submitters and the connection task.
/// A full queue fails the submit with `Backpressure` rather than blocking.
pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// An item handed to the connection task for transmission.
pub(crate) enum Outbound {
    /// A numbered request; the frame is fetched from the pending table at
    /// send time so a cancelled request is simply skipped.
    Request(u64),
    /// A pre-encoded untracked frame (position reports, invocation acks,
    /// keep-alives).
    OneWay(String),
}

/// Outcome of completing a `message_ack`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Completion {
    /// A future was waiting; it has been resolved.
    Completed,
    /// The id was issued but is no longer pending (completed, cancelled,
    /// timed out). The response is discarded.
    Late,
    /// The id was never issued by this client — a protocol violation.
    NeverIssued,
}

struct PendingEntry {
    frame: String,
    completer: Completer,
}

struct SendState {
    /// Last issued id; 0 means none yet.
    last_id: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

struct SenderShared {
    state: Mutex<SendState>,
    queue: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

/// Handle through which every component submits frames.
#[derive(Clone)]
pub(crate) struct RequestSender {
    shared: Arc<SenderShared>,
}

impl RequestSender {
    pub(crate) fn new(queue: mpsc::Sender<Outbound>) -> Self {
        RequestSender {
            shared: Arc::new(SenderShared {
                state: Mutex::new(SendState { last_id: 0, pending: BTreeMap::new() }),
                queue,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number, record, and enqueue a request.
    ///
    /// `build` receives the assigned `reply_to` and produces the message;
    /// it runs under the numbering lock, so enqueue order equals id order.
    /// Returns the id and the completion receiver.
    pub(crate) fn request(
        &self,
        build: impl FnOnce(u64) -> ConnectionMessage,
    ) -> Result<(u64, crate::future::CompletionRx), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut state = self.shared.state.lock();
        if state.last_id == u64::MAX {
            // Fail closed rather than wrap and corrupt correlation.
            return Err(ClientError::ProtocolError("request numbering exhausted".to_owned()));
        }
        let id = state.last_id + 1;
        state.last_id = id;
        let frame = encode_frame(&build(id));
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, PendingEntry { frame, completer: tx });
        match self.shared.queue.try_send(Outbound::Request(id)) {
            Ok(()) => Ok((id, rx)),
            Err(e) => {
                state.pending.remove(&id);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(ClientError::Backpressure),
                    mpsc::error::TrySendError::Closed(_) => Err(ClientError::Closed),
                }
            }
        }
    }

    /// Enqueue an untracked frame.
    pub(crate) fn send_one_way(&self, msg: &ConnectionMessage) -> Result<(), ClientError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        match self.shared.queue.try_send(Outbound::OneWay(encode_frame(msg))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ClientError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::Closed),
        }
    }

    /// Resolve the pending entry for a `message_ack`.
    pub(crate) fn complete(&self, id: u64, msg: ConnectionMessage) -> Completion {
        let mut state = self.shared.state.lock();
        match state.pending.remove(&id) {
            Some(entry) => {
                // The receiver may already be gone (timed-out wait); that is
                // the discard path, not an error.
                let _ = entry.completer.send(Ok(msg));
                Completion::Completed
            }
            None if id <= state.last_id => Completion::Late,
            None => Completion::NeverIssued,
        }
    }

    /// Drop the pending entry for a cancelled request. No wire effect.
    pub(crate) fn forget(&self, id: u64) {
        let mut state = self.shared.state.lock();
        if state.pending.remove(&id).is_some() {
            debug!(reply_to = id, "pending request cancelled");
        }
    }

    /// The frame for `id`, if the request is still pending.
    pub(crate) fn frame_for(&self, id: u64) -> Option<String> {
        let state = self.shared.state.lock();
        state.pending.get(&id).map(|e| e.frame.clone())
    }

    /// All pending frames in ascending `reply_to` order, for replay.
    pub(crate) fn replay_snapshot(&self) -> Vec<(u64, String)> {
        let state = self.shared.state.lock();
        state.pending.iter().map(|(id, e)| (*id, e.frame.clone())).collect()
    }

    /// Fail every pending future with `err`, emptying the table.
    pub(crate) fn fail_all(&self, err: &ClientError) {
        let drained: Vec<PendingEntry> = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.pending).into_values().collect()
        };
        if !drained.is_empty() {
            debug!(n = drained.len(), error = %err, "failing pending requests");
        }
        for entry in drained {
            let _ = entry.completer.send(Err(err.clone()));
        }
    }

    /// Reject all further submissions and fail everything pending.
    pub(crate) fn close(&self, err: &ClientError) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.fail_all(err);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_protocol::{RegisterService, RegisterServiceAck};

    fn register(id: u64) -> ConnectionMessage {
        ConnectionMessage::RegisterService(RegisterService {
            reply_to: id,
            channel: "test.Channel".to_owned(),
        })
    }

    fn ack(id: u64) -> ConnectionMessage {
        ConnectionMessage::RegisterServiceAck(RegisterServiceAck { message_ack: id })
    }

    fn sender() -> (RequestSender, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        (RequestSender::new(tx), rx)
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_from_one() {
        let (sender, _rx) = sender();
        let (a, _) = sender.request(register).unwrap();
        let (b, _) = sender.request(register).unwrap();
        let (c, _) = sender.request(register).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn pending_entry_exists_until_completed() {
        let (sender, _rx) = sender();
        let (id, rx) = sender.request(register).unwrap();
        assert_eq!(sender.pending_len(), 1);
        assert_eq!(sender.complete(id, ack(id)), Completion::Completed);
        assert_eq!(sender.pending_len(), 0);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn completing_an_issued_but_absent_id_is_late_not_orphan() {
        let (sender, _rx) = sender();
        let (id, _completion) = sender.request(register).unwrap();
        sender.forget(id);
        assert_eq!(sender.complete(id, ack(id)), Completion::Late);
    }

    #[tokio::test]
    async fn completing_a_never_issued_id_is_flagged() {
        let (sender, _rx) = sender();
        let _ = sender.request(register).unwrap();
        assert_eq!(sender.complete(9999, ack(9999)), Completion::NeverIssued);
    }

    #[tokio::test]
    async fn replay_snapshot_is_ascending_and_skips_cancelled() {
        let (sender, _rx) = sender();
        let (a, _rx_a) = sender.request(register).unwrap();
        let (b, _rx_b) = sender.request(register).unwrap();
        let (c, _rx_c) = sender.request(register).unwrap();
        sender.forget(b);
        let ids: Vec<u64> = sender.replay_snapshot().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[tokio::test]
    async fn full_queue_fails_with_backpressure_and_leaves_no_entry() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = RequestSender::new(tx);
        sender.request(register).unwrap();
        let err = sender.request(register).unwrap_err();
        assert_eq!(err, ClientError::Backpressure);
        assert_eq!(sender.pending_len(), 1);
    }

    #[tokio::test]
    async fn close_fails_pending_and_rejects_new_requests() {
        let (sender, _rx) = sender();
        let (_, completion) = sender.request(register).unwrap();
        sender.close(&ClientError::ConnectionLost);
        assert_eq!(completion.await.unwrap(), Err(ClientError::ConnectionLost));
        assert_eq!(sender.request(register).unwrap_err(), ClientError::Closed);
    }
}
