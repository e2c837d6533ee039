//! Per-namespace state machine: turns committed batches into engine writes
//! and resolves every proposal's completion slot exactly once.
//!
//! Consecutive batchable writes on distinct keys share one [`WriteBatch`] and
//! one engine commit. A command whose key is already in the open group, or
//! that cannot be grouped at all, flushes the group and runs on its own, so
//! per-key order always matches log order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::{decode_command, Command, CommandRouter, HandlerCtx, Reply};
use crate::engine::{KvStore, WriteBatch};
use crate::error::KvError;
use crate::index::{IndexCondition, IndexManager};
use crate::snapshot::SnapshotSyncer;
use crate::types::{
    BatchSource, CommittedBatch, ControlRequest, Entry, EntryKind, SchemaChange, SchemaChangeKind,
    SnapshotDescriptor, StateMachine,
};
use crate::wait::{ApplyResult, PendingRegistry};

const SLOW_INFO_THRESHOLD: Duration = Duration::from_secs(1);
const SLOW_DEBUG_THRESHOLD: Duration = Duration::from_millis(100);

/// Decides whether a batch replayed from another cluster may be applied.
///
/// Cross-cluster timestamp conflicts are resolved here when a deployment
/// needs it; the state machine itself takes no position.
pub trait SyncedBatchPolicy: Send + Sync {
    fn admit(&self, batch: &CommittedBatch) -> bool;
}

/// Admits every replayed batch as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdmitAll;

impl SyncedBatchPolicy for AdmitAll {
    fn admit(&self, _batch: &CommittedBatch) -> bool {
        true
    }
}

#[derive(Default)]
pub struct ApplyStats {
    applied_entries: AtomicU64,
    grouped_commits: AtomicU64,
    grouped_commands: AtomicU64,
    standalone_commands: AtomicU64,
    group_failures: AtomicU64,
    sweep_failures: AtomicU64,
    slow_commands: AtomicU64,
    rejected_batches: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyStatsSnapshot {
    pub applied_entries: u64,
    pub grouped_commits: u64,
    pub grouped_commands: u64,
    pub standalone_commands: u64,
    pub group_failures: u64,
    pub sweep_failures: u64,
    pub slow_commands: u64,
    pub rejected_batches: u64,
}

impl ApplyStats {
    pub fn snapshot(&self) -> ApplyStatsSnapshot {
        ApplyStatsSnapshot {
            applied_entries: self.applied_entries.load(Ordering::Relaxed),
            grouped_commits: self.grouped_commits.load(Ordering::Relaxed),
            grouped_commands: self.grouped_commands.load(Ordering::Relaxed),
            standalone_commands: self.standalone_commands.load(Ordering::Relaxed),
            group_failures: self.group_failures.load(Ordering::Relaxed),
            sweep_failures: self.sweep_failures.load(Ordering::Relaxed),
            slow_commands: self.slow_commands.load(Ordering::Relaxed),
            rejected_batches: self.rejected_batches.load(Ordering::Relaxed),
        }
    }
}

impl ApplyStatsSnapshot {
    /// `name:value` pairs in the order `INFO` prints them.
    pub fn fields(&self) -> [(&'static str, u64); 8] {
        [
            ("applied_entries", self.applied_entries),
            ("grouped_commits", self.grouped_commits),
            ("grouped_commands", self.grouped_commands),
            ("standalone_commands", self.standalone_commands),
            ("group_failures", self.group_failures),
            ("sweep_failures", self.sweep_failures),
            ("slow_commands", self.slow_commands),
            ("rejected_batches", self.rejected_batches),
        ]
    }
}

/// Writes deferred into one physical commit.
struct BatchAccumulator {
    batch: WriteBatch,
    results: Vec<(u64, ApplyResult)>,
    keys: HashSet<Vec<u8>>,
    started: Option<Instant>,
    last_cmd: String,
}

impl BatchAccumulator {
    fn new() -> Self {
        Self {
            batch: WriteBatch::new(),
            results: Vec::new(),
            keys: HashSet::new(),
            started: None,
            last_cmd: String::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn len(&self) -> usize {
        self.results.len()
    }
}

pub struct StateMachineOptions {
    pub max_batch_cmds: usize,
    pub propose_timeout: Duration,
}

impl Default for StateMachineOptions {
    fn default() -> Self {
        Self {
            max_batch_cmds: 500,
            propose_timeout: Duration::from_millis(5000),
        }
    }
}

pub struct KvStateMachine {
    namespace: String,
    replica_id: u64,
    store: Arc<KvStore>,
    indexes: Arc<IndexManager>,
    pending: Arc<PendingRegistry>,
    router: CommandRouter,
    opts: StateMachineOptions,
    syncer: SnapshotSyncer,
    synced_policy: Box<dyn SyncedBatchPolicy>,
    stats: ApplyStats,
    /// False while a snapshot restore runs and after a failed one, until a
    /// later restore succeeds.
    operational: AtomicBool,
    /// Held by every batch apply and for the whole of a restore.
    apply_gate: tokio::sync::Mutex<()>,
}

impl KvStateMachine {
    pub fn new(
        namespace: impl Into<String>,
        replica_id: u64,
        store: Arc<KvStore>,
        pending: Arc<PendingRegistry>,
        syncer: SnapshotSyncer,
        opts: StateMachineOptions,
    ) -> anyhow::Result<Self> {
        let namespace = namespace.into();
        let indexes = Arc::new(IndexManager::new(store.clone()));
        let tables = indexes.load_indexes()?;
        tracing::info!(namespace = %namespace, tables, "index definitions loaded");
        Ok(Self {
            namespace,
            replica_id,
            store,
            indexes,
            pending,
            router: CommandRouter::new(),
            opts: StateMachineOptions {
                max_batch_cmds: opts.max_batch_cmds.max(1),
                ..opts
            },
            syncer,
            synced_policy: Box::new(AdmitAll),
            stats: ApplyStats::default(),
            operational: AtomicBool::new(true),
            apply_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_synced_policy(mut self, policy: impl SyncedBatchPolicy + 'static) -> Self {
        self.synced_policy = Box::new(policy);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    pub fn pending(&self) -> &Arc<PendingRegistry> {
        &self.pending
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn stats(&self) -> ApplyStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::Acquire)
    }

    fn ensure_operational(&self) -> Result<(), KvError> {
        if self.is_operational() {
            Ok(())
        } else {
            Err(KvError::Snapshot(format!(
                "namespace {} is waiting for a snapshot restore",
                self.namespace
            )))
        }
    }

    fn ctx(&self) -> HandlerCtx<'_> {
        HandlerCtx {
            store: &self.store,
            indexes: &self.indexes,
        }
    }

    /// Run a read-only command against local state.
    pub fn execute_read(&self, cmd: &Command) -> Result<Reply, KvError> {
        self.ensure_operational()?;
        if self.router.is_write(&cmd.name) {
            return Err(KvError::InvalidCommand(format!(
                "'{}' must go through the log",
                cmd.name
            )));
        }
        let mut batch = WriteBatch::new();
        self.router.dispatch(&self.ctx(), cmd, &mut batch)
    }

    pub fn search_index(
        &self,
        table: &str,
        field: &str,
        cond: &IndexCondition,
        reverse: bool,
    ) -> Result<(usize, Vec<Vec<u8>>), KvError> {
        self.ensure_operational()?;
        self.indexes.search(table, field, cond, reverse)
    }

    fn resolve(&self, id: u64, result: ApplyResult) {
        self.pending.trigger(id, result);
    }

    fn log_slow(&self, what: &str, count: usize, cost: Duration) {
        if cost >= SLOW_INFO_THRESHOLD {
            self.stats.slow_commands.fetch_add(1, Ordering::Relaxed);
            tracing::info!(namespace = %self.namespace, cmd = what, count, cost_ms = cost.as_millis() as u64, "slow write");
        } else if cost >= SLOW_DEBUG_THRESHOLD {
            tracing::debug!(namespace = %self.namespace, cmd = what, count, cost_ms = cost.as_millis() as u64, "slow write");
        }
    }

    fn flush(&self, acc: &mut BatchAccumulator) {
        self.commit_group(acc, None);
    }

    /// Commit the open group. With `applied` set, the batch position goes
    /// into the same engine write, or into one of its own when no group is
    /// open or the group failed.
    fn commit_group(&self, acc: &mut BatchAccumulator, applied: Option<(u64, u64)>) {
        if acc.is_empty() {
            if let Some((term, index)) = applied {
                self.record_applied(term, index);
            }
            return;
        }
        let mut done = std::mem::replace(acc, BatchAccumulator::new());
        if let Some((term, index)) = applied {
            done.batch.set_applied(term, index);
        }
        let count = done.results.len();
        let started = done.started.unwrap_or_else(Instant::now);
        match self.store.commit(done.batch) {
            Ok(()) => {
                self.stats.grouped_commits.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .grouped_commands
                    .fetch_add(count as u64, Ordering::Relaxed);
                for (id, result) in done.results {
                    self.resolve(id, result);
                }
            }
            Err(err) => {
                self.stats.group_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(namespace = %self.namespace, count, error = ?err, "group commit failed");
                let failure = KvError::Storage(format!("{err:#}"));
                for (id, _) in done.results {
                    self.resolve(id, Err(failure.clone()));
                }
                if let Some((term, index)) = applied {
                    self.record_applied(term, index);
                }
            }
        }
        self.log_slow(&done.last_cmd, count, started.elapsed());
    }

    fn apply_command(&self, acc: &mut BatchAccumulator, entry: &Entry) {
        let id = entry.header.id;
        let cmd = match decode_command(&entry.data) {
            Ok(cmd) => cmd,
            Err(err) => {
                self.resolve(id, Err(KvError::Decode(format!("{err:#}"))));
                return;
            }
        };
        let ctx = self.ctx();

        let groupable = self.router.is_batchable_write(&cmd.name)
            && acc.len() < self.opts.max_batch_cmds
            && !acc.keys.contains(cmd.pk());
        if groupable {
            let savepoint = acc.batch.savepoint();
            match self.router.dispatch(&ctx, &cmd, &mut acc.batch) {
                Ok(reply) => {
                    acc.started.get_or_insert_with(Instant::now);
                    acc.keys.insert(cmd.pk().to_vec());
                    acc.results.push((id, Ok(reply)));
                    acc.last_cmd.clone_from(&cmd.name);
                }
                Err(err) => {
                    // Nothing of a failed command may reach the shared commit.
                    acc.batch.rollback_to(savepoint);
                    self.resolve(id, Err(err));
                }
            }
            return;
        }

        self.flush(acc);
        let started = Instant::now();
        let mut batch = WriteBatch::new();
        let result = self
            .router
            .dispatch(&ctx, &cmd, &mut batch)
            .and_then(|reply| {
                self.store.commit(batch)?;
                Ok(reply)
            });
        self.stats.standalone_commands.fetch_add(1, Ordering::Relaxed);
        self.log_slow(&cmd.name, 1, started.elapsed());
        self.resolve(id, result);
    }

    fn apply_backup_control(&self, data: &[u8]) -> ApplyResult {
        let req: ControlRequest =
            serde_json::from_slice(data).map_err(|err| KvError::Decode(err.to_string()))?;
        if req.op != ControlRequest::BACKUP {
            return Err(KvError::UnknownData);
        }
        Ok(Reply::ok())
    }

    fn apply_schema_control(&self, data: &[u8]) -> ApplyResult {
        let change: SchemaChange =
            serde_json::from_slice(data).map_err(|err| KvError::Decode(err.to_string()))?;
        if change.table != change.index.table {
            return Err(KvError::InvalidCommand(format!(
                "schema change for table {} carries an index of table {}",
                change.table, change.index.table
            )));
        }
        match change.kind {
            SchemaChangeKind::AddHsetIndex => {
                tracing::info!(namespace = %self.namespace, table = %change.table, field = %change.index.index_field, "adding index");
                self.indexes.add_index(change.index)?;
            }
            SchemaChangeKind::DeleteHsetIndex => {
                tracing::info!(namespace = %self.namespace, table = %change.table, field = %change.index.index_field, "removing index");
                self.indexes
                    .remove_index(&change.table, &change.index.index_field)?;
            }
        }
        Ok(Reply::ok())
    }

    fn fail_batch(&self, batch: &CommittedBatch, err: KvError) {
        for entry in &batch.entries {
            self.resolve(entry.header.id, Err(err.clone()));
        }
        if let Some(batch_id) = batch.batch_id {
            self.resolve(batch_id, Err(err));
        }
    }

    fn reject_batch(&self, batch: &CommittedBatch) {
        self.stats.rejected_batches.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(namespace = %self.namespace, entries = batch.entries.len(), "replicated batch rejected");
        self.fail_batch(batch, KvError::Rejected);
    }

    /// A batch may only run against a serving namespace and only past the
    /// applied position; anything at or below it is already in local state.
    fn admit_position(&self, term: u64, index: u64) -> Result<(), KvError> {
        self.ensure_operational()?;
        let (applied_term, applied_index) = self.applied_position();
        if (term, index) <= (applied_term, applied_index) {
            return Err(KvError::Snapshot(format!(
                "batch {term}-{index} is behind applied position {applied_term}-{applied_index}"
            )));
        }
        Ok(())
    }

    /// Fail whatever the batch left unresolved. Returns how many were swept.
    fn sweep_unresolved(&self, entries: &[Entry]) -> usize {
        let mut swept = 0;
        for entry in entries {
            if self.pending.trigger(entry.header.id, Err(KvError::UnknownData)) {
                swept += 1;
                tracing::warn!(namespace = %self.namespace, id = entry.header.id, "entry left unresolved after apply");
            }
        }
        self.stats
            .sweep_failures
            .fetch_add(swept as u64, Ordering::Relaxed);
        swept
    }

    /// Apply one committed batch at `(term, index)`. Returns true when one of
    /// its entries asked for a checkpoint.
    ///
    /// Must run off the async runtime: it waits for any restore in progress.
    pub fn apply(&self, batch: CommittedBatch, term: u64, index: u64) -> bool {
        let _gate = self.apply_gate.blocking_lock();
        let started = Instant::now();
        if let Err(err) = self.admit_position(term, index) {
            tracing::warn!(namespace = %self.namespace, term, index, error = %err, "batch not applied");
            self.fail_batch(&batch, err);
            return false;
        }
        if batch.source == BatchSource::ClusterSyncer && !self.synced_policy.admit(&batch) {
            self.reject_batch(&batch);
            self.record_applied(term, index);
            return false;
        }

        let mut force_backup = false;
        let mut acc = BatchAccumulator::new();
        for entry in &batch.entries {
            match EntryKind::from_data_type(entry.header.data_type) {
                Some(EntryKind::Command) => self.apply_command(&mut acc, entry),
                Some(EntryKind::ControlBackup) => {
                    self.flush(&mut acc);
                    let result = self.apply_backup_control(&entry.data);
                    if result.is_ok() {
                        force_backup = true;
                    }
                    self.resolve(entry.header.id, result);
                }
                Some(EntryKind::ControlSchema) => {
                    self.flush(&mut acc);
                    let result = self.apply_schema_control(&entry.data);
                    self.resolve(entry.header.id, result);
                }
                None => {
                    self.flush(&mut acc);
                    self.resolve(entry.header.id, Err(KvError::UnknownData));
                }
            }
        }
        self.commit_group(&mut acc, Some((term, index)));

        self.sweep_unresolved(&batch.entries);
        self.stats
            .applied_entries
            .fetch_add(batch.entries.len() as u64, Ordering::Relaxed);

        let cost = started.elapsed();
        if cost > self.opts.propose_timeout / 2 {
            tracing::warn!(
                namespace = %self.namespace,
                term,
                index,
                entries = batch.entries.len(),
                cost_ms = cost.as_millis() as u64,
                "slow batch"
            );
        }
        if let Some(batch_id) = batch.batch_id {
            self.resolve(batch_id, Ok(Reply::ok()));
        }
        force_backup
    }

    fn record_applied(&self, term: u64, index: u64) {
        if let Err(err) = self.store.record_applied(term, index) {
            tracing::warn!(namespace = %self.namespace, term, index, error = ?err, "failed to record applied position");
        }
    }

    pub fn snapshot(&self, term: u64, index: u64) -> anyhow::Result<SnapshotDescriptor> {
        let checkpoint_dir = self.store.checkpoint(term, index)?;
        Ok(SnapshotDescriptor {
            replica_id: self.replica_id,
            term,
            index,
            checkpoint_dir,
        })
    }

    pub async fn restore(
        &self,
        startup: bool,
        desc: &SnapshotDescriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.operational.store(false, Ordering::Release);
        // Batches wait here until the new generation and its index
        // definitions are both in place.
        let _gate = self.apply_gate.lock().await;
        let restored = self.syncer.restore(startup, desc, cancel).await;
        match restored {
            Ok(()) => {
                let tables = self.indexes.load_indexes()?;
                self.operational.store(true, Ordering::Release);
                tracing::info!(namespace = %self.namespace, term = desc.term, index = desc.index, tables, "snapshot installed");
                Ok(())
            }
            Err(err) => {
                self.operational.store(false, Ordering::Release);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    fn apply_batch(&self, batch: CommittedBatch, term: u64, index: u64) -> bool {
        self.apply(batch, term, index)
    }

    fn get_snapshot(&self, term: u64, index: u64) -> anyhow::Result<SnapshotDescriptor> {
        self.snapshot(term, index)
    }

    async fn restore_from_snapshot(
        &self,
        startup: bool,
        desc: &SnapshotDescriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.restore(startup, desc, cancel).await
    }

    fn applied_position(&self) -> (u64, u64) {
        match self.store.applied() {
            Ok(position) => position.unwrap_or((0, 0)),
            Err(err) => {
                tracing::warn!(namespace = %self.namespace, error = ?err, "failed to read applied position");
                (0, 0)
            }
        }
    }
}
