//! Persistent ordered key-value engine for one namespace.
//!
//! Layout under the namespace root:
//!
//! ```text
//! CURRENT                  name of the live generation directory
//! db-0000000001/           fjall keyspace holding the live state
//! backup/<term>-<index>/   checkpoints: `data/` keyspace + `manifest.json`
//! ```
//!
//! Restoring a checkpoint copies it into a fresh generation and swaps
//! `CURRENT`, so a failed restore never touches the generation in service.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use crate::codec;

const CURRENT_FILE: &str = "CURRENT";
pub const BACKUP_DIR: &str = "backup";
const CHECKPOINT_DATA_DIR: &str = "data";
const CHECKPOINT_MANIFEST: &str = "manifest.json";
const MANIFEST_VERSION: u8 = 1;
/// Keys copied per fjall batch while writing a checkpoint.
const CHECKPOINT_COPY_BATCH: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    /// Primary records.
    Data,
    /// Secondary index entries.
    Index,
    /// Index definitions and bookkeeping.
    Meta,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Data, Partition::Index, Partition::Meta];

    pub fn name(self) -> &'static str {
        match self {
            Partition::Data => "data",
            Partition::Index => "index",
            Partition::Meta => "meta",
        }
    }
}

struct EngineInner {
    generation: u64,
    dir: PathBuf,
    keyspace: Keyspace,
    data: PartitionHandle,
    index: PartitionHandle,
    meta: PartitionHandle,
}

impl EngineInner {
    fn open(dir: &Path, generation: u64) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create engine dir {}", dir.display()))?;
        let keyspace = fjall::Config::new(dir)
            .open()
            .with_context(|| format!("open keyspace {}", dir.display()))?;
        let data = keyspace.open_partition(Partition::Data.name(), PartitionCreateOptions::default())?;
        let index = keyspace.open_partition(Partition::Index.name(), PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition(Partition::Meta.name(), PartitionCreateOptions::default())?;
        Ok(Self {
            generation,
            dir: dir.to_path_buf(),
            keyspace,
            data,
            index,
            meta,
        })
    }

    fn handle(&self, partition: Partition) -> &PartitionHandle {
        match partition {
            Partition::Data => &self.data,
            Partition::Index => &self.index,
            Partition::Meta => &self.meta,
        }
    }
}

#[derive(Clone, Debug)]
enum BatchOp {
    Put(Partition, Vec<u8>, Vec<u8>),
    Delete(Partition, Vec<u8>),
}

/// Grouped write. Mutations become visible together on commit; until then
/// they are only observable through [`KvStore::get_in`] and
/// [`KvStore::prefix_in`].
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    overlay: BTreeMap<(Partition, Vec<u8>), Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, partition: Partition, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert((partition, key.clone()), Some(value.clone()));
        self.ops.push(BatchOp::Put(partition, key, value));
    }

    pub fn delete(&mut self, partition: Partition, key: Vec<u8>) {
        self.overlay.insert((partition, key.clone()), None);
        self.ops.push(BatchOp::Delete(partition, key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Stages the applied `(term, index)` so it commits with the rest of
    /// the batch.
    pub fn set_applied(&mut self, term: u64, index: u64) {
        self.put(
            Partition::Meta,
            codec::META_APPLIED_KEY.to_vec(),
            codec::encode_position(term, index),
        );
    }

    /// Marks the current end of the batch.
    pub fn savepoint(&self) -> usize {
        self.ops.len()
    }

    /// Drops every mutation recorded after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: usize) {
        if savepoint >= self.ops.len() {
            return;
        }
        self.ops.truncate(savepoint);
        self.overlay.clear();
        for op in &self.ops {
            match op {
                BatchOp::Put(p, k, v) => {
                    self.overlay.insert((*p, k.clone()), Some(v.clone()));
                }
                BatchOp::Delete(p, k) => {
                    self.overlay.insert((*p, k.clone()), None);
                }
            }
        }
    }

    /// `Some(None)` when the batch deletes `key`, `None` when it never touches it.
    fn pending(&self, partition: Partition, key: &[u8]) -> Option<Option<&[u8]>> {
        self.overlay
            .get(&(partition, key.to_vec()))
            .map(|v| v.as_deref())
    }

    fn pending_prefix<'a>(
        &'a self,
        partition: Partition,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)> + 'a {
        self.overlay
            .range((Bound::Included((partition, prefix.to_vec())), Bound::Unbounded))
            .take_while(move |((p, k), _)| *p == partition && k.starts_with(prefix))
            .map(|((_, k), v)| (k.as_slice(), v.as_deref()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub term: u64,
    pub index: u64,
    pub created_unix_ms: u64,
    /// Entry count copied per partition.
    pub entries: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CheckpointManifestEnvelope {
    version: u8,
    checksum_crc32: u32,
    payload: CheckpointManifest,
}

pub struct KvStore {
    root: PathBuf,
    inner: RwLock<Arc<EngineInner>>,
    #[cfg(test)]
    fail_commits: std::sync::atomic::AtomicUsize,
}

impl KvStore {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create store root {}", root.display()))?;
        let generation = match fs::read_to_string(root.join(CURRENT_FILE)) {
            Ok(name) => parse_generation(name.trim())?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                write_current(&root, 1)?;
                1
            }
            Err(err) => return Err(err).context("read CURRENT"),
        };
        remove_stale_generations(&root, generation);
        let inner = EngineInner::open(&root.join(generation_name(generation)), generation)?;
        Ok(Self {
            root,
            inner: RwLock::new(Arc::new(inner)),
            #[cfg(test)]
            fail_commits: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self) -> PathBuf {
        backup_dir(&self.root)
    }

    pub fn checkpoint_path(&self, term: u64, index: u64) -> PathBuf {
        self.backup_dir().join(checkpoint_dir_name(term, index))
    }

    fn current(&self) -> Arc<EngineInner> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, partition: Partition, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let inner = self.current();
        Ok(inner.handle(partition).get(key)?.map(|v| v.to_vec()))
    }

    /// Point read that sees the uncommitted writes of `batch`.
    pub fn get_in(
        &self,
        batch: &WriteBatch,
        partition: Partition,
        key: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        match batch.pending(partition, key) {
            Some(pending) => Ok(pending.map(|v| v.to_vec())),
            None => self.get(partition, key),
        }
    }

    /// Visit `[start, end)` in key order (or reverse). `visit` returns
    /// `false` to stop early. `end = None` scans to the end of the partition.
    pub fn scan(
        &self,
        partition: Partition,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
        mut visit: impl FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let inner = self.current();
        let handle = inner.handle(partition);
        let range = (
            Bound::Included(start.to_vec()),
            end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec())),
        );
        if reverse {
            for item in handle.range(range).rev() {
                let (key, value) = item?;
                if !visit(&key, &value)? {
                    break;
                }
            }
        } else {
            for item in handle.range(range) {
                let (key, value) = item?;
                if !visit(&key, &value)? {
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn prefix(&self, partition: Partition, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let end = codec::prefix_successor(prefix);
        let mut out = Vec::new();
        self.scan(partition, prefix, end.as_deref(), false, |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })?;
        Ok(out)
    }

    /// Prefix scan merged with the uncommitted writes of `batch`.
    pub fn prefix_in(
        &self,
        batch: &WriteBatch,
        partition: Partition,
        prefix: &[u8],
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self.prefix(partition, prefix)?.into_iter().collect();
        for (key, value) in batch.pending_prefix(partition, prefix) {
            match value {
                Some(v) => {
                    merged.insert(key.to_vec(), v.to_vec());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Apply every mutation of `batch` in one atomic engine write.
    pub fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let armed = self
                .fail_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if armed.is_ok() {
                anyhow::bail!("injected commit failure");
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        let inner = self.current();
        let mut write = inner.keyspace.batch();
        for op in batch.ops {
            match op {
                BatchOp::Put(p, k, v) => write.insert(inner.handle(p), k, v),
                BatchOp::Delete(p, k) => write.remove(inner.handle(p), k),
            }
        }
        write.commit().context("commit write batch")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_commits(&self, count: usize) {
        self.fail_commits
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Record `(term, index)` on its own, for batches that wrote nothing else.
    pub fn record_applied(&self, term: u64, index: u64) -> anyhow::Result<()> {
        let mut batch = WriteBatch::new();
        batch.set_applied(term, index);
        self.commit(batch)
    }

    pub fn applied(&self) -> anyhow::Result<Option<(u64, u64)>> {
        match self.get(Partition::Meta, codec::META_APPLIED_KEY)? {
            Some(bytes) => Ok(Some(codec::decode_position(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a checkpoint of the current state addressed by `(term, index)`.
    ///
    /// Callers must not run it concurrently with writes to this store; the
    /// apply pipeline only checkpoints between batches.
    pub fn checkpoint(&self, term: u64, index: u64) -> anyhow::Result<PathBuf> {
        let final_dir = self.checkpoint_path(term, index);
        if self.is_local_backup_ok(term, index) {
            return Ok(final_dir);
        }

        let backup_dir = self.backup_dir();
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("create backup dir {}", backup_dir.display()))?;
        let staging = backup_dir.join(format!(".tmp-{}", checkpoint_dir_name(term, index)));
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("clear checkpoint staging {}", staging.display()))?;
        }

        let inner = self.current();
        inner.keyspace.persist(PersistMode::SyncAll)?;
        let mut entries = BTreeMap::new();
        {
            let target = fjall::Config::new(staging.join(CHECKPOINT_DATA_DIR))
                .open()
                .context("open checkpoint keyspace")?;
            for partition in Partition::ALL {
                let dst = target.open_partition(partition.name(), PartitionCreateOptions::default())?;
                let mut batch = target.batch();
                let mut pending = 0usize;
                let mut copied = 0u64;
                for item in inner.handle(partition).iter() {
                    let (key, value) = item?;
                    batch.insert(&dst, key, value);
                    pending += 1;
                    copied += 1;
                    if pending >= CHECKPOINT_COPY_BATCH {
                        batch.commit()?;
                        batch = target.batch();
                        pending = 0;
                    }
                }
                batch.commit()?;
                entries.insert(partition.name().to_string(), copied);
            }
            target.persist(PersistMode::SyncAll)?;
        }

        let manifest = CheckpointManifest {
            term,
            index,
            created_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            entries,
        };
        write_checkpoint_manifest(&staging.join(CHECKPOINT_MANIFEST), &manifest)?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)
                .with_context(|| format!("replace checkpoint {}", final_dir.display()))?;
        }
        fs::rename(&staging, &final_dir).with_context(|| {
            format!("publish checkpoint {} -> {}", staging.display(), final_dir.display())
        })?;
        tracing::info!(term, index, dir = %final_dir.display(), "checkpoint written");
        Ok(final_dir)
    }

    /// True when a complete checkpoint for exactly `(term, index)` exists locally.
    pub fn is_local_backup_ok(&self, term: u64, index: u64) -> bool {
        match load_checkpoint_manifest(&self.checkpoint_path(term, index)) {
            Ok(Some(manifest)) => manifest.term == term && manifest.index == index,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!(term, index, error = ?err, "local checkpoint is not usable");
                false
            }
        }
    }

    /// Replace the live state with the checkpoint at `(term, index)`.
    pub fn restore(&self, term: u64, index: u64) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.is_local_backup_ok(term, index),
            "checkpoint {} is missing or incomplete",
            checkpoint_dir_name(term, index)
        );
        let source = self.checkpoint_path(term, index).join(CHECKPOINT_DATA_DIR);
        let next = self.current().generation + 1;
        let target = self.root.join(generation_name(next));

        let opened = (|| -> anyhow::Result<EngineInner> {
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            copy_dir_recursive(&source, &target)?;
            let inner = EngineInner::open(&target, next)?;
            inner
                .meta
                .insert(codec::META_APPLIED_KEY, codec::encode_position(term, index))?;
            inner.keyspace.persist(PersistMode::SyncAll)?;
            write_current(&self.root, next)?;
            Ok(inner)
        })();
        let inner = match opened {
            Ok(inner) => inner,
            Err(err) => {
                let _ = fs::remove_dir_all(&target);
                return Err(err.context(format!("restore checkpoint {term}-{index}")));
            }
        };

        let old = {
            let mut guard = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, Arc::new(inner))
        };
        // Readers may still hold the old generation; it is removed on next open then.
        if let Ok(old) = Arc::try_unwrap(old) {
            let dir = old.dir.clone();
            drop(old);
            if let Err(err) = fs::remove_dir_all(&dir) {
                tracing::debug!(dir = %dir.display(), error = ?err, "old generation not removed");
            }
        }
        tracing::info!(term, index, generation = next, "restored from checkpoint");
        Ok(())
    }
}

pub fn backup_dir(root: &Path) -> PathBuf {
    root.join(BACKUP_DIR)
}

pub fn checkpoint_dir_name(term: u64, index: u64) -> String {
    format!("{term:016x}-{index:016x}")
}

fn generation_name(generation: u64) -> String {
    format!("db-{generation:010}")
}

fn parse_generation(name: &str) -> anyhow::Result<u64> {
    name.strip_prefix("db-")
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("invalid CURRENT generation {name:?}"))
}

fn write_current(root: &Path, generation: u64) -> anyhow::Result<()> {
    let path = root.join(CURRENT_FILE);
    let tmp = root.join(format!("{CURRENT_FILE}.tmp"));
    fs::write(&tmp, generation_name(generation))
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn remove_stale_generations(root: &Path, live: u64) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_generation(name) {
            Ok(generation) if generation != live => {
                if let Err(err) = fs::remove_dir_all(entry.path()) {
                    tracing::warn!(dir = name, error = ?err, "failed to remove stale generation");
                }
            }
            _ => {}
        }
    }
}

fn manifest_payload_checksum(manifest: &CheckpointManifest) -> anyhow::Result<u32> {
    let payload = serde_json::to_vec(manifest).context("serialize checkpoint manifest payload")?;
    Ok(crc32fast::hash(&payload))
}

fn write_checkpoint_manifest(path: &Path, manifest: &CheckpointManifest) -> anyhow::Result<()> {
    let envelope = CheckpointManifestEnvelope {
        version: MANIFEST_VERSION,
        checksum_crc32: manifest_payload_checksum(manifest)?,
        payload: manifest.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&envelope).context("serialize checkpoint manifest")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("write checkpoint manifest temp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace checkpoint manifest {}", path.display()))?;
    Ok(())
}

/// Load and verify a checkpoint manifest. `Ok(None)` when the checkpoint does
/// not exist at all.
pub fn load_checkpoint_manifest(checkpoint_dir: &Path) -> anyhow::Result<Option<CheckpointManifest>> {
    let path = checkpoint_dir.join(CHECKPOINT_MANIFEST);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path).with_context(|| format!("read checkpoint manifest {}", path.display()))?;
    let envelope: CheckpointManifestEnvelope = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse checkpoint manifest {}", path.display()))?;
    anyhow::ensure!(
        envelope.version == MANIFEST_VERSION,
        "unsupported checkpoint manifest version {} at {}",
        envelope.version,
        path.display()
    );
    let actual = manifest_payload_checksum(&envelope.payload)?;
    anyhow::ensure!(
        actual == envelope.checksum_crc32,
        "checkpoint manifest checksum mismatch at {} (expected={}, actual={})",
        path.display(),
        envelope.checksum_crc32,
        actual
    );
    anyhow::ensure!(
        checkpoint_dir.join(CHECKPOINT_DATA_DIR).is_dir(),
        "checkpoint data missing at {}",
        checkpoint_dir.display()
    );
    Ok(Some(envelope.payload))
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create dir {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KvStore::open(dir.path().join("ns")).expect("open store");
        (dir, store)
    }

    #[test]
    fn batch_overlay_and_rollback() {
        let (_dir, store) = open_store();
        let mut batch = WriteBatch::new();
        batch.put(Partition::Data, b"a".to_vec(), b"1".to_vec());
        let mark = batch.savepoint();
        batch.put(Partition::Data, b"b".to_vec(), b"2".to_vec());
        batch.delete(Partition::Data, b"a".to_vec());
        assert_eq!(store.get_in(&batch, Partition::Data, b"a").expect("get"), None);
        assert_eq!(store.get_in(&batch, Partition::Data, b"b").expect("get"), Some(b"2".to_vec()));

        batch.rollback_to(mark);
        assert_eq!(batch.len(), 1);
        assert_eq!(store.get_in(&batch, Partition::Data, b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(store.get_in(&batch, Partition::Data, b"b").expect("get"), None);
        assert_eq!(store.get(Partition::Data, b"a").expect("get"), None);

        store.commit(batch).expect("commit");
        assert_eq!(store.get(Partition::Data, b"a").expect("get"), Some(b"1".to_vec()));
    }

    #[test]
    fn prefix_in_merges_pending_writes() {
        let (_dir, store) = open_store();
        let mut seed = WriteBatch::new();
        seed.put(Partition::Index, b"p1".to_vec(), Vec::new());
        seed.put(Partition::Index, b"p2".to_vec(), Vec::new());
        seed.put(Partition::Index, b"q1".to_vec(), Vec::new());
        store.commit(seed).expect("commit");

        let mut batch = WriteBatch::new();
        batch.delete(Partition::Index, b"p1".to_vec());
        batch.put(Partition::Index, b"p3".to_vec(), Vec::new());
        batch.put(Partition::Data, b"p4".to_vec(), Vec::new());
        let keys: Vec<Vec<u8>> = store
            .prefix_in(&batch, Partition::Index, b"p")
            .expect("prefix")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"p2".to_vec(), b"p3".to_vec()]);
    }

    #[test]
    fn scan_respects_bounds_and_direction() {
        let (_dir, store) = open_store();
        let mut batch = WriteBatch::new();
        for key in [b"k1", b"k2", b"k3", b"k4"] {
            batch.put(Partition::Data, key.to_vec(), Vec::new());
        }
        store.commit(batch).expect("commit");

        let mut forward = Vec::new();
        store
            .scan(Partition::Data, b"k2", Some(b"k4"), false, |k, _| {
                forward.push(k.to_vec());
                Ok(true)
            })
            .expect("scan");
        assert_eq!(forward, vec![b"k2".to_vec(), b"k3".to_vec()]);

        let mut backward = Vec::new();
        store
            .scan(Partition::Data, b"k1", None, true, |k, _| {
                backward.push(k.to_vec());
                Ok(backward.len() < 2)
            })
            .expect("scan");
        assert_eq!(backward, vec![b"k4".to_vec(), b"k3".to_vec()]);
    }

    #[test]
    fn checkpoint_then_restore_rewinds_state() {
        let (_dir, store) = open_store();
        let mut batch = WriteBatch::new();
        batch.put(Partition::Data, b"k".to_vec(), b"v1".to_vec());
        store.commit(batch).expect("commit");

        assert!(!store.is_local_backup_ok(1, 10));
        store.checkpoint(1, 10).expect("checkpoint");
        assert!(store.is_local_backup_ok(1, 10));
        assert!(!store.is_local_backup_ok(1, 11));

        let mut batch = WriteBatch::new();
        batch.put(Partition::Data, b"k".to_vec(), b"v2".to_vec());
        batch.put(Partition::Data, b"other".to_vec(), b"x".to_vec());
        store.commit(batch).expect("commit");

        store.restore(1, 10).expect("restore");
        assert_eq!(store.get(Partition::Data, b"k").expect("get"), Some(b"v1".to_vec()));
        assert_eq!(store.get(Partition::Data, b"other").expect("get"), None);
        assert_eq!(store.applied().expect("applied"), Some((1, 10)));
    }

    #[test]
    fn restored_generation_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("ns");
        {
            let store = KvStore::open(&root).expect("open");
            let mut batch = WriteBatch::new();
            batch.put(Partition::Data, b"k".to_vec(), b"v1".to_vec());
            store.commit(batch).expect("commit");
            store.checkpoint(2, 5).expect("checkpoint");
            store.restore(2, 5).expect("restore");
        }
        let store = KvStore::open(&root).expect("reopen");
        assert_eq!(store.get(Partition::Data, b"k").expect("get"), Some(b"v1".to_vec()));
    }

    #[test]
    fn corrupt_manifest_is_not_a_valid_backup() {
        let (_dir, store) = open_store();
        store.checkpoint(1, 3).expect("checkpoint");
        let manifest = store.checkpoint_path(1, 3).join(CHECKPOINT_MANIFEST);
        let text = fs::read_to_string(&manifest).expect("read manifest");
        fs::write(&manifest, text.replace("\"index\": 3", "\"index\": 4")).expect("tamper");
        assert!(!store.is_local_backup_ok(1, 3));
        assert!(store.restore(1, 3).is_err());
    }

    #[test]
    fn applied_position_commits_with_data() {
        let (_dir, store) = open_store();
        let mut batch = WriteBatch::new();
        batch.put(Partition::Data, b"k".to_vec(), b"v".to_vec());
        batch.set_applied(1, 4);
        store.fail_next_commits(1);
        assert!(store.commit(batch).is_err());
        assert_eq!(store.applied().expect("applied"), None);
        assert_eq!(store.get(Partition::Data, b"k").expect("get"), None);

        let mut batch = WriteBatch::new();
        batch.put(Partition::Data, b"k".to_vec(), b"v".to_vec());
        batch.set_applied(1, 4);
        store.commit(batch).expect("commit");
        assert_eq!(store.applied().expect("applied"), Some((1, 4)));
        assert_eq!(store.get(Partition::Data, b"k").expect("get"), Some(b"v".to_vec()));
    }

    #[test]
    fn failed_restore_keeps_live_state() {
        let (_dir, store) = open_store();
        let mut batch = WriteBatch::new();
        batch.put(Partition::Data, b"k".to_vec(), b"live".to_vec());
        store.commit(batch).expect("commit");
        assert!(store.restore(9, 9).is_err());
        assert_eq!(store.get(Partition::Data, b"k").expect("get"), Some(b"live".to_vec()));
    }
}
