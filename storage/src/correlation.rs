//! Request/result correlation for reads answered by the storage actor.
//!
//! A reader registers a request id and receives a one-shot receiver. The
//! actor publishes the result under that id, which removes the entry and
//! wakes exactly that reader. Entries are removed on publish, on cancel, or
//! when the table is closed, so nothing lingers once the actor is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Identifier correlating a read request with its result.
pub type RequestId = u64;

pub struct CorrelationTable<T> {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<T>>>,
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a fresh request id. Ids are never reused, so one caller may
    /// have any number of reads in flight.
    pub fn register(&self) -> (RequestId, oneshot::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver `value` to the reader waiting on `id`.
    ///
    /// Returns `false` if nobody is waiting any more (the id was cancelled or
    /// the receiver was dropped); the value is discarded.
    pub fn publish(&self, id: RequestId, value: T) -> bool {
        let Some(tx) = self.waiters.lock().remove(&id) else {
            return false;
        };
        tx.send(value).is_ok()
    }

    /// Forget a request whose command never reached the actor.
    pub fn cancel(&self, id: RequestId) {
        self.waiters.lock().remove(&id);
    }

    /// Drop every pending waiter. Their receivers resolve with an error.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        drained.len()
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
