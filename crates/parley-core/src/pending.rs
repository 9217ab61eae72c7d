//! Table of outstanding requests awaiting their correlated responses.
//!
//! Each entry settles exactly once, through whichever of these wins: the
//! response arrives, the caller's deadline fires (the caller then evicts the
//! entry), or the connection ends and `cancel_all` sweeps the table. Late and
//! duplicate responses find no entry and are ignored.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ErrorCode, ParleyError};
use crate::frame::ReplyPayload;

/// Why every live entry is being rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    LocalDisconnect,
    PeerDisconnect,
    HeartbeatLost,
    EndpointDetached,
}

impl CancelReason {
    fn to_error(self, message_type: &str) -> ParleyError {
        match self {
            CancelReason::LocalDisconnect => ParleyError::Connection {
                code: ErrorCode::Disconnected,
                reason: format!("disconnected locally while '{message_type}' was in flight"),
            },
            CancelReason::PeerDisconnect => ParleyError::Connection {
                code: ErrorCode::Disconnected,
                reason: format!("peer disconnected while '{message_type}' was in flight"),
            },
            CancelReason::HeartbeatLost => ParleyError::Connection {
                code: ErrorCode::ConnectionLost,
                reason: format!("connection lost while '{message_type}' was in flight"),
            },
            CancelReason::EndpointDetached => {
                ParleyError::target_not_found(format!(
                    "peer endpoint went away while '{message_type}' was in flight"
                ))
            }
        }
    }
}

struct PendingEntry {
    message_type: String,
    tx: oneshot::Sender<Result<Value, ParleyError>>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry for an outgoing request and return the receiver the
    /// caller awaits (under its own deadline).
    pub fn register(
        &self,
        id: Uuid,
        message_type: &str,
    ) -> oneshot::Receiver<Result<Value, ParleyError>> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            id,
            PendingEntry {
                message_type: message_type.to_string(),
                tx,
            },
        );
        rx
    }

    /// Settle the entry matching `correlation_id`. Returns false for unknown
    /// ids (late, duplicate, or fired-and-forgotten requests).
    pub fn settle(&self, correlation_id: Uuid, reply: ReplyPayload) -> bool {
        let Some(entry) = self.entries.lock().remove(&correlation_id) else {
            return false;
        };
        // The receiver may already be gone (caller timed out between our
        // remove and its evict); either way the entry is spent.
        let _ = entry.tx.send(reply.into_result());
        true
    }

    /// Remove an entry without settling it; the timeout path.
    pub fn evict(&self, id: Uuid) -> Option<String> {
        self.entries
            .lock()
            .remove(&id)
            .map(|entry| entry.message_type)
    }

    /// Reject every live entry. Returns how many were swept.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(reason.to_error(&entry.message_type)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
