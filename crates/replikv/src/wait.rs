//! Completion slots keyed by proposal id.
//!
//! A proposer registers a slot before handing an entry to consensus and waits
//! on the receiver. The apply path triggers each slot exactly once; whatever
//! is still registered after a batch is swept with `UnknownData`.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::command::Reply;
use crate::error::KvError;

pub type ApplyResult = Result<Reply, KvError>;

#[derive(Default)]
pub struct PendingRegistry {
    slots: Mutex<HashMap<u64, oneshot::Sender<ApplyResult>>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<ApplyResult>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, id: u64) -> anyhow::Result<oneshot::Receiver<ApplyResult>> {
        let mut slots = self.slots();
        anyhow::ensure!(!slots.contains_key(&id), "duplicate proposal id {id}");
        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Ok(rx)
    }

    /// Resolve and remove the slot for `id`. Returns false when nothing was
    /// waiting, which is the normal case on followers.
    pub fn trigger(&self, id: u64, result: ApplyResult) -> bool {
        let Some(tx) = self.slots().remove(&id) else {
            return false;
        };
        // The waiter may already have timed out and dropped its receiver.
        let _ = tx.send(result);
        true
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.slots().contains_key(&id)
    }

    /// Drop a slot without resolving it.
    pub fn cancel(&self, id: u64) {
        self.slots().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}
