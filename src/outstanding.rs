//! The outstanding-request table: the map from outbound request id to the
//! pending caller awaiting its response.
//!
//! Insertion is paired with a single consuming removal on completion;
//! duplicate completions are ignored.  Mutation happens under one std mutex
//! that is never held across an await.
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::session::DisconnectReason;
use crate::types::{Id, ResponsePayload};

pub(crate) struct OutstandingRequests {
    entries: Mutex<HashMap<Id, PendingEntry>>,
}

struct PendingEntry {
    /// Method name, kept for diagnostics only.
    method: String,
    /// Whether a `$/cancelRequest` notification already went out for this id.
    cancel_sent: bool,
    tx: oneshot::Sender<Result<ResponsePayload>>,
}

impl OutstandingRequests {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending outbound call and hand back the receiver its
    /// response will arrive on.
    pub fn register(&self, id: Id, method: &str) -> oneshot::Receiver<Result<ResponsePayload>> {
        let (tx, rx) = oneshot::channel();
        let previous = self.entries.lock().unwrap().insert(
            id.clone(),
            PendingEntry {
                method: method.to_string(),
                cancel_sent: false,
                tx,
            },
        );
        // Ids come from a monotonic counter, so a collision can only be a bug.
        debug_assert!(previous.is_none(), "duplicate outbound request id {id}");
        rx
    }

    /// Complete the pending call for `id`, consuming its entry.
    ///
    /// Returns false when no such entry exists (an unrecognized or duplicate
    /// response), which the read loop logs and drops.
    pub fn complete(&self, id: &Id, payload: ResponsePayload) -> bool {
        let entry = self.entries.lock().unwrap().remove(id);
        match entry {
            Some(entry) => {
                // The receiver may already be dropped if the caller gave up;
                // that is not an error.
                let _ = entry.tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    /// Drop the entry for `id` without completing it (used when the request
    /// never made it onto the wire).
    pub fn remove(&self, id: &Id) {
        self.entries.lock().unwrap().remove(id);
    }

    /// Record that a cancellation notification is being sent for `id`.
    ///
    /// Only the first caller per id gets `true`; this is what keeps
    /// `$/cancelRequest` to exactly one per call.
    pub fn mark_cancel_sent(&self, id: &Id) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(entry) if !entry.cancel_sent => {
                entry.cancel_sent = true;
                true
            }
            _ => false,
        }
    }

    /// Fault every pending entry with `ConnectionLost`; called exactly once
    /// during disconnection, before the `Disconnected` event fires.
    pub fn abort_all(&self, reason: DisconnectReason) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().collect()
        };
        for (id, entry) in drained {
            tracing::debug!(request_id = %id, method = %entry.method,
                "faulting pending outbound request due to disconnection");
            let _ = entry.tx.send(Err(RpcError::ConnectionLost { reason }));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
