//! Cross-cluster replication envelope and the in-order receiver.
//!
//! A source cluster ships its committed log as [`ReplicationEntry`] records.
//! Positions must increase per group; duplicates are dropped and gaps are
//! held back until the missing entries arrive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{BatchSource, CommittedBatch, SnapshotDescriptor, StateMachine};

const DEFAULT_MAX_BUFFERED: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationEntryKind {
    /// Payload is a committed batch.
    Normal,
    /// Payload is a snapshot descriptor to catch up from.
    RawSnapshot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    pub kind: ReplicationEntryKind,
    pub cluster: String,
    pub group: String,
    pub term: u64,
    pub index: u64,
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

impl ReplicationEntry {
    pub fn normal(
        cluster: &str,
        group: &str,
        term: u64,
        index: u64,
        batch: &CommittedBatch,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            kind: ReplicationEntryKind::Normal,
            cluster: cluster.to_string(),
            group: group.to_string(),
            term,
            index,
            timestamp: batch.timestamp,
            payload: serde_json::to_vec(batch).context("encode replicated batch")?,
        })
    }

    pub fn raw_snapshot(cluster: &str, group: &str, desc: &SnapshotDescriptor, timestamp: i64) -> anyhow::Result<Self> {
        Ok(Self {
            kind: ReplicationEntryKind::RawSnapshot,
            cluster: cluster.to_string(),
            group: group.to_string(),
            term: desc.term,
            index: desc.index,
            timestamp,
            payload: serde_json::to_vec(desc).context("encode replicated snapshot")?,
        })
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("encode replication entry")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).context("decode replication entry")
    }

    pub fn position(&self) -> (u64, u64) {
        (self.term, self.index)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    /// Entries now safe to apply, in order.
    Ready(Vec<ReplicationEntry>),
    /// Held until the gap before it closes.
    Buffered,
    /// At or behind the last accepted position.
    Stale,
}

/// Tracks the last accepted `(term, index)` of each group.
pub struct ReplicationCursor {
    last: HashMap<String, (u64, u64)>,
    held: HashMap<String, BTreeMap<u64, ReplicationEntry>>,
    max_buffered: usize,
}

impl Default for ReplicationCursor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED)
    }
}

impl ReplicationCursor {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            last: HashMap::new(),
            held: HashMap::new(),
            max_buffered,
        }
    }

    /// Resume `group` after `(term, index)`.
    pub fn resume(&mut self, group: &str, term: u64, index: u64) {
        self.last.insert(group.to_string(), (term, index));
    }

    pub fn last(&self, group: &str) -> Option<(u64, u64)> {
        self.last.get(group).copied()
    }

    pub fn buffered(&self, group: &str) -> usize {
        self.held.get(group).map_or(0, BTreeMap::len)
    }

    pub fn offer(&mut self, entry: ReplicationEntry) -> anyhow::Result<Offer> {
        let group = entry.group.clone();
        let Some(last) = self.last.get(&group).copied() else {
            // First entry seen for the group sets the starting point.
            self.last.insert(group.clone(), entry.position());
            let mut ready = vec![entry];
            self.release(&group, &mut ready);
            return Ok(Offer::Ready(ready));
        };

        if entry.index <= last.1 {
            return Ok(Offer::Stale);
        }
        anyhow::ensure!(
            entry.term >= last.0,
            "group {group} term went backwards: {} after {}",
            entry.term,
            last.0
        );
        // A snapshot jumps the group forward past any gap.
        if entry.index == last.1 + 1 || entry.kind == ReplicationEntryKind::RawSnapshot {
            self.last.insert(group.clone(), entry.position());
            let mut ready = vec![entry];
            self.release(&group, &mut ready);
            return Ok(Offer::Ready(ready));
        }

        let held = self.held.entry(group.clone()).or_default();
        if held.contains_key(&entry.index) {
            return Ok(Offer::Stale);
        }
        anyhow::ensure!(
            held.len() < self.max_buffered,
            "replication buffer for group {group} is full ({} entries)",
            held.len()
        );
        held.insert(entry.index, entry);
        Ok(Offer::Buffered)
    }

    /// Put back entries that were released but never applied, and move the
    /// group back to `last`, the position of the last entry that was.
    pub fn rewind(
        &mut self,
        group: &str,
        last: Option<(u64, u64)>,
        unapplied: impl IntoIterator<Item = ReplicationEntry>,
    ) {
        match last {
            Some(position) => {
                self.last.insert(group.to_string(), position);
            }
            None => {
                self.last.remove(group);
            }
        }
        let held = self.held.entry(group.to_string()).or_default();
        for entry in unapplied {
            held.insert(entry.index, entry);
        }
        if held.is_empty() {
            self.held.remove(group);
        }
    }

    fn release(&mut self, group: &str, ready: &mut Vec<ReplicationEntry>) {
        let Some(held) = self.held.get_mut(group) else {
            return;
        };
        loop {
            let Some(&(term, index)) = self.last.get(group) else {
                return;
            };
            // Anything at or below the accepted index can never apply.
            while held.first_key_value().is_some_and(|(i, _)| *i <= index) {
                held.pop_first();
            }
            match held.first_key_value() {
                Some((next, entry)) if *next == index + 1 && entry.term >= term => {}
                _ => break,
            }
            let Some((_, entry)) = held.pop_first() else {
                break;
            };
            self.last.insert(group.to_string(), entry.position());
            ready.push(entry);
        }
        if held.is_empty() {
            self.held.remove(group);
        }
    }
}

/// Applies a replication stream to a local state machine.
pub struct ReplicationReceiver {
    cursor: ReplicationCursor,
    sm: Arc<dyn StateMachine>,
    cancel: CancellationToken,
}

impl ReplicationReceiver {
    pub fn new(sm: Arc<dyn StateMachine>, cursor: ReplicationCursor, cancel: CancellationToken) -> Self {
        Self { cursor, sm, cancel }
    }

    pub fn cursor(&self) -> &ReplicationCursor {
        &self.cursor
    }

    /// Offer one entry; returns how many entries were applied as a result.
    ///
    /// When an entry fails to apply, it and everything released after it
    /// stay with the cursor and the group resumes from the last applied one.
    pub async fn receive(&mut self, entry: ReplicationEntry) -> anyhow::Result<usize> {
        let group = entry.group.clone();
        let mut applied_to = self.cursor.last(&group);
        let ready = match self.cursor.offer(entry)? {
            Offer::Ready(ready) => ready,
            Offer::Buffered => return Ok(0),
            Offer::Stale => {
                tracing::debug!("dropping stale replication entry");
                return Ok(0);
            }
        };
        let mut count = 0;
        let mut ready = ready.into_iter();
        while let Some(entry) = ready.next() {
            if let Err(err) = self.apply(&entry).await {
                tracing::warn!(group = %group, term = entry.term, index = entry.index, error = ?err, "replicated entry not applied");
                self.cursor
                    .rewind(&group, applied_to, std::iter::once(entry).chain(ready));
                return Err(err);
            }
            applied_to = Some(entry.position());
            count += 1;
        }
        Ok(count)
    }

    async fn apply(&self, entry: &ReplicationEntry) -> anyhow::Result<()> {
        let (term, index) = entry.position();
        match entry.kind {
            ReplicationEntryKind::Normal => {
                let mut batch: CommittedBatch =
                    serde_json::from_slice(&entry.payload).context("decode replicated batch")?;
                batch.source = BatchSource::ClusterSyncer;
                let sm = self.sm.clone();
                let force_backup = tokio::task::spawn_blocking(move || sm.apply_batch(batch, term, index))
                    .await
                    .context("apply task")?;
                if force_backup {
                    let sm = self.sm.clone();
                    tokio::task::spawn_blocking(move || sm.get_snapshot(term, index))
                        .await
                        .context("snapshot task")??;
                }
            }
            ReplicationEntryKind::RawSnapshot => {
                let desc: SnapshotDescriptor =
                    serde_json::from_slice(&entry.payload).context("decode replicated snapshot")?;
                tracing::info!(cluster = %entry.cluster, group = %entry.group, term, index, "replicated snapshot received");
                self.sm.restore_from_snapshot(false, &desc, &self.cancel).await?;
            }
        }
        Ok(())
    }
}
