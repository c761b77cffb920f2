//! # Pending-Call Table
//!
//! Outstanding calls this peer has issued, keyed by call id. Each entry is the
//! sending half of a oneshot the caller is awaiting. Ids increase
//! monotonically and settled slots are removed, so the table is sparse.
//!
//! Calls that timed out but whose eventual reply still matters (a `connect`
//! that may yet grant an instance) are moved to an abandoned set. Their late
//! reply is reclaimed by the peer instead of counting as a violation.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::DashSet;
use postrpc::CallId;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::client::Error;

/// How a call ended, as delivered to its caller.
pub(crate) type Outcome = std::result::Result<Value, Error>;

pub struct PendingCalls {
    entries: DashMap<CallId, oneshot::Sender<Outcome>>,
    abandoned: DashSet<CallId>,
    next_id: AtomicU64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            abandoned: DashSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates the next call id and registers a waiter for it.
    pub(crate) fn issue(&self) -> (CallId, oneshot::Receiver<Outcome>) {
        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        (id, rx)
    }

    /// Delivers the outcome of `id` and removes its entry.
    ///
    /// An unknown id means the two peers disagree about what is outstanding;
    /// this includes a second settlement of the same call.
    pub(crate) fn settle(&self, id: CallId, outcome: Outcome) -> Result<(), Error> {
        let (_, tx) = self.entries.remove(&id).ok_or(Error::UnknownCall(id))?;
        if tx.send(outcome).is_err() {
            tracing::debug!(call = %id, "caller stopped waiting before its reply arrived");
        }
        Ok(())
    }

    /// Drops the entry for `id` without settling it.
    pub(crate) fn cancel(&self, id: CallId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drops the waiter for `id` but remembers the id, so its late reply can
    /// be told apart from an unsolicited one.
    pub(crate) fn abandon(&self, id: CallId) {
        self.abandoned.insert(id);
        self.entries.remove(&id);
    }

    /// True, once, if `id` was abandoned.
    pub(crate) fn reclaim(&self, id: CallId) -> bool {
        self.abandoned.remove(&id).is_some()
    }

    /// Fails every outstanding call with `error`. Returns how many were failed.
    pub(crate) fn fail_all(&self, error: Error) -> usize {
        self.abandoned.clear();
        let keys: Vec<CallId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, tx)) = self.entries.remove(&key) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
