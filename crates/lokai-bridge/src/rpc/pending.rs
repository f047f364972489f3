//! Outstanding call table.
//!
//! Every resolution path (response, completion, timeout, crash, abandoned
//! caller) goes through `remove`, so whichever path removes the entry first
//! is the only one that delivers a terminal result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::types::{RpcError, StreamEvent};

/// Completion slot of one outstanding call.
pub(crate) enum PendingCall {
    Unary {
        method: String,
        tx: oneshot::Sender<Result<Value, RpcError>>,
    },
    Streaming {
        method: String,
        tx: mpsc::UnboundedSender<StreamEvent>,
    },
}

impl PendingCall {
    pub(crate) fn method(&self) -> &str {
        match self {
            Self::Unary { method, .. } | Self::Streaming { method, .. } => method,
        }
    }

    /// Deliver the terminal outcome. Consumes the slot.
    pub(crate) fn resolve(self, outcome: Result<Value, RpcError>) {
        match self {
            Self::Unary { tx, .. } => {
                let _ = tx.send(outcome);
            }
            Self::Streaming { tx, .. } => {
                let event = match outcome {
                    Ok(result) => StreamEvent::Complete(result),
                    Err(e) => StreamEvent::Error(e),
                };
                let _ = tx.send(event);
            }
        }
    }

    /// Forward a non-terminal token. Returns `false` for unary calls.
    fn deliver_token(&self, token: String) -> bool {
        match self {
            Self::Unary { .. } => false,
            Self::Streaming { tx, .. } => {
                let _ = tx.send(StreamEvent::Token(token));
                true
            }
        }
    }
}

/// Result of routing a token to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenDelivery {
    Delivered,
    NotStreaming,
    Unknown,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<u64, PendingCall>,
    /// Set once the worker instance is gone; later inserts fail with it.
    closed: Option<RpcError>,
}

/// Shared, lock-protected table of outstanding calls keyed by id.
#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    inner: Arc<Mutex<Inner>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call. Fails if the table was closed by a crash or stop.
    pub(crate) fn insert(&self, id: u64, call: PendingCall) -> Result<(), RpcError> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        inner.calls.insert(id, call);
        Ok(())
    }

    pub(crate) fn remove(&self, id: u64) -> Option<PendingCall> {
        self.lock().calls.remove(&id)
    }

    pub(crate) fn deliver_token(&self, id: u64, token: String) -> TokenDelivery {
        let inner = self.lock();
        match inner.calls.get(&id) {
            Some(call) if call.deliver_token(token) => TokenDelivery::Delivered,
            Some(_) => TokenDelivery::NotStreaming,
            None => TokenDelivery::Unknown,
        }
    }

    /// Close the table and hand back every outstanding call.
    pub(crate) fn close(&self, reason: RpcError) -> Vec<(u64, PendingCall)> {
        let mut inner = self.lock();
        inner.closed.get_or_insert(reason);
        let mut drained: Vec<_> = inner.calls.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: u64) -> bool {
        self.lock().calls.contains_key(&id)
    }

    /// Guard that removes `id` when dropped.
    pub(crate) fn guard(&self, id: u64) -> PendingGuard {
        PendingGuard {
            table: self.clone(),
            id,
        }
    }
}

/// Removes its entry on drop so an abandoned caller never leaks a slot.
/// Ids are never reused, so removing an already-resolved id is a no-op.
pub(crate) struct PendingGuard {
    table: PendingTable,
    id: u64,
}

impl PendingGuard {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) const fn table(&self) -> &PendingTable {
        &self.table
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(call) = self.table.remove(self.id) {
            debug!(id = self.id, method = call.method(), "Caller went away, dropping pending call");
        }
    }
}
