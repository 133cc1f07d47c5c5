//! Holding pen for negotiation payloads that arrive before the peer session
//! can consume them.
//!
//! Candidates must never reach a peer connection that has no remote
//! description, and offers can land before the callee has picked up; both are
//! queued here per peer and flushed in arrival order once the session is
//! ready.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Ice,
    Offer,
}

#[derive(Debug, Default)]
pub struct SignalingBuffer {
    queues: Mutex<HashMap<(BufferKind, PeerId), VecDeque<Value>>>,
}

impl SignalingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the peer's queue for `kind`, creating it if absent.
    pub fn enqueue(&self, kind: BufferKind, peer: &str, item: Value) {
        self.queues
            .lock()
            .entry((kind, peer.to_string()))
            .or_default()
            .push_back(item);
    }

    /// Number of buffered items for `(kind, peer)`.
    pub fn pending(&self, kind: BufferKind, peer: &str) -> usize {
        self.queues
            .lock()
            .get(&(kind, peer.to_string()))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Applies `consumer` to each buffered item sequentially, in arrival
    /// order, and returns the per-item results. The queue is removed before
    /// consumption starts, so it is gone afterwards regardless of individual
    /// failures; a failed item never blocks the ones behind it. Null items
    /// are skipped without invoking the consumer. A missing queue is a no-op
    /// returning an empty list.
    pub async fn drain_into<T, F, Fut>(
        &self,
        kind: BufferKind,
        peer: &str,
        mut consumer: F,
    ) -> Vec<Result<T>>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let items = match self.queues.lock().remove(&(kind, peer.to_string())) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            if item.is_null() {
                continue;
            }
            results.push(consumer(item).await);
        }
        results
    }

    /// Drops every queue belonging to `peer`, for all kinds.
    pub fn clear_peer(&self, peer: &str) {
        self.queues.lock().retain(|(_, id), _| id != peer);
    }
}
