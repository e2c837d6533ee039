//! Single-node stand-in for the consensus layer.
//!
//! Proposals are queued to a sequencer task that cuts them into batches,
//! stamps each batch with the next `(term, index)` and applies it on a
//! blocking thread. Callers wait on their completion slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::Reply;
use crate::error::KvError;
use crate::types::{unix_millis, BatchSource, CommittedBatch, Entry, EntryKind, StateMachine};
use crate::wait::PendingRegistry;

const QUEUE_DEPTH: usize = 4096;

#[derive(Clone, Debug)]
pub struct ProposerOptions {
    pub max_batch: usize,
    pub batch_wait: Duration,
    pub propose_timeout: Duration,
}

impl Default for ProposerOptions {
    fn default() -> Self {
        Self {
            max_batch: 500,
            batch_wait: Duration::from_micros(200),
            propose_timeout: Duration::from_millis(5000),
        }
    }
}

pub struct LocalProposer {
    pending: Arc<PendingRegistry>,
    tx: mpsc::Sender<Entry>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl LocalProposer {
    /// Spawn the sequencer for `sm` and return the proposing handle.
    pub fn start(
        sm: Arc<dyn StateMachine>,
        pending: Arc<PendingRegistry>,
        opts: ProposerOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let timeout = opts.propose_timeout;
        tokio::spawn(run_sequencer(sm, pending.clone(), rx, opts, cancel));
        Arc::new(Self {
            pending,
            tx,
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    pub async fn propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<Reply, KvError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id)?;
        let entry = Entry::new(id, unix_millis(), kind, data);
        if self.tx.send(entry).await.is_err() {
            self.pending.cancel(id);
            return Err(KvError::Stopped);
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KvError::Cancelled),
            Err(_) => {
                self.pending.cancel(id);
                Err(KvError::Timeout)
            }
        }
    }
}

async fn run_sequencer(
    sm: Arc<dyn StateMachine>,
    pending: Arc<PendingRegistry>,
    mut rx: mpsc::Receiver<Entry>,
    opts: ProposerOptions,
    cancel: CancellationToken,
) {
    let (mut term, mut index) = sm.applied_position();
    if term == 0 {
        term = 1;
    }
    let max_batch = opts.max_batch.max(1);
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        let mut entries = vec![first];
        let deadline = Instant::now() + opts.batch_wait;
        while entries.len() < max_batch {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) | Err(_) => break,
            }
        }

        // A snapshot restore can move the applied position past ours.
        let applied = sm.applied_position();
        if applied > (term, index) {
            (term, index) = applied;
        }
        index += 1;
        let batch = CommittedBatch {
            entries,
            batch_id: None,
            timestamp: unix_millis(),
            source: BatchSource::Local,
        };
        let apply_sm = sm.clone();
        let force_backup =
            match tokio::task::spawn_blocking(move || apply_sm.apply_batch(batch, term, index)).await {
                Ok(force) => force,
                Err(err) => {
                    tracing::error!(term, index, error = ?err, "apply task failed");
                    false
                }
            };
        if force_backup {
            let snap_sm = sm.clone();
            match tokio::task::spawn_blocking(move || snap_sm.get_snapshot(term, index)).await {
                Ok(Ok(desc)) => {
                    tracing::info!(term, index, dir = %desc.checkpoint_dir.display(), "forced checkpoint written");
                }
                Ok(Err(err)) => tracing::warn!(term, index, error = ?err, "forced checkpoint failed"),
                Err(err) => tracing::warn!(term, index, error = ?err, "checkpoint task failed"),
            }
        }
    }

    // Fail whatever is still queued so callers do not wait for their timeout.
    rx.close();
    while let Ok(entry) = rx.try_recv() {
        pending.trigger(entry.header.id, Err(KvError::Stopped));
    }
    tracing::info!(term, index, "sequencer stopped");
}
