//! Snapshot catch-up: fetch a checkpoint from whichever peer holds it and
//! install it locally.
//!
//! There is no coordinator. Every attempt re-reads the peer list, keeps the
//! peers that report a complete checkpoint at the exact `(term, index)`, and
//! picks one by attempt number so consecutive attempts rotate through them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::{self, KvStore};
use crate::types::SnapshotDescriptor;

const RESTORE_RETRIES: usize = 3;
const PEER_LOOKUP_RETRIES: usize = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// What a node advertises about itself for one namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSyncInfo {
    pub replica_id: u64,
    /// Host peers use to reach this node's rsync daemon.
    pub remote_addr: String,
    /// Snapshot-info service address.
    pub api_addr: String,
    pub rsync_module: String,
    pub data_root: PathBuf,
}

#[async_trait]
pub trait ClusterInfo: Send + Sync {
    /// Current sync info of every node serving `namespace`, self included.
    async fn snapshot_sync_info(&self, namespace: &str) -> anyhow::Result<Vec<SnapshotSyncInfo>>;

    /// Whether `peer` holds a complete checkpoint at `(term, index)`.
    async fn check_backup(
        &self,
        peer: &SnapshotSyncInfo,
        namespace: &str,
        term: u64,
        index: u64,
    ) -> anyhow::Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncSource {
    /// Checkpoint directory on this host (another node's data root).
    Local { path: PathBuf },
    /// `rsync` daemon source, `addr::path`.
    Remote { addr: String, path: String },
}

#[async_trait]
pub trait FileSync: Send + Sync {
    /// Make `dst` a copy of the checkpoint tree at `source`.
    async fn transfer(
        &self,
        source: &SyncSource,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Directory copy for local sources, `rsync -a --delete` for remote ones.
/// Both land in a staging directory next to `dst` and are renamed into place.
#[derive(Clone, Copy, Debug, Default)]
pub struct RsyncFileSync;

fn staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dst.with_file_name(format!(".sync-{name}"))
}

fn publish_staging(staging: &Path, dst: &Path) -> anyhow::Result<()> {
    if dst.exists() {
        std::fs::remove_dir_all(dst).with_context(|| format!("replace {}", dst.display()))?;
    }
    std::fs::rename(staging, dst)
        .with_context(|| format!("publish {} -> {}", staging.display(), dst.display()))?;
    Ok(())
}

fn copy_checkpoint(src: &Path, dst: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(src.is_dir(), "checkpoint source {} does not exist", src.display());
    let staging = staging_path(dst);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .with_context(|| format!("clear staging {}", staging.display()))?;
    }
    engine::copy_dir_recursive(src, &staging)?;
    publish_staging(&staging, dst)
}

#[async_trait]
impl FileSync for RsyncFileSync {
    async fn transfer(
        &self,
        source: &SyncSource,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        match source {
            SyncSource::Local { path } => {
                let src = path.clone();
                let target = dst.to_path_buf();
                let copy = tokio::task::spawn_blocking(move || copy_checkpoint(&src, &target));
                tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("checkpoint copy cancelled"),
                    res = copy => res.context("checkpoint copy task")?,
                }
            }
            SyncSource::Remote { addr, path } => {
                // Staging survives failed attempts so rsync can resume.
                let staging = staging_path(dst);
                let mut child = tokio::process::Command::new("rsync")
                    .arg("-a")
                    .arg("--delete")
                    .arg(format!("{addr}::{path}/"))
                    .arg(&staging)
                    .kill_on_drop(true)
                    .spawn()
                    .context("spawn rsync")?;
                let status = tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("rsync from {addr} cancelled"),
                    status = child.wait() => status.context("wait for rsync")?,
                };
                anyhow::ensure!(status.success(), "rsync {addr}::{path} exited with {status}");
                let target = dst.to_path_buf();
                tokio::task::spawn_blocking(move || publish_staging(&staging, &target))
                    .await
                    .context("publish task")?
            }
        }
    }
}

pub struct SnapshotSyncer {
    namespace: String,
    replica_id: u64,
    broadcast_addr: String,
    data_root: PathBuf,
    store: Arc<KvStore>,
    cluster: Arc<dyn ClusterInfo>,
    files: Arc<dyn FileSync>,
    backoff: Duration,
}

impl SnapshotSyncer {
    pub fn new(
        namespace: impl Into<String>,
        replica_id: u64,
        broadcast_addr: impl Into<String>,
        data_root: impl Into<PathBuf>,
        store: Arc<KvStore>,
        cluster: Arc<dyn ClusterInfo>,
        files: Arc<dyn FileSync>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            replica_id,
            broadcast_addr: broadcast_addr.into(),
            data_root: data_root.into(),
            store,
            cluster,
            files,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Wait between attempts. One second unless overridden.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Install the checkpoint named by `desc`, fetching it from a peer when
    /// it is not already present locally.
    pub async fn restore(
        &self,
        startup: bool,
        desc: &SnapshotDescriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(
            namespace = %self.namespace,
            term = desc.term,
            index = desc.index,
            source_replica = desc.replica_id,
            startup,
            "restoring from snapshot"
        );
        let mut last_err = anyhow!("snapshot restore not attempted");
        for attempt in 0..RESTORE_RETRIES {
            match self.try_restore(attempt, desc, cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(namespace = %self.namespace, attempt, error = ?err, "snapshot restore attempt failed");
                    last_err = err;
                }
            }
            if attempt + 1 < RESTORE_RETRIES {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(last_err),
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }
        Err(last_err.context("failed to restore from snapshot"))
    }

    async fn try_restore(
        &self,
        attempt: usize,
        desc: &SnapshotDescriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let (term, index) = (desc.term, desc.index);
        if self.store.is_local_backup_ok(term, index) {
            tracing::info!(namespace = %self.namespace, term, index, "checkpoint already present locally");
        } else {
            let source = self.pick_source(attempt, term, index, cancel).await?;
            let dst = self.store.checkpoint_path(term, index);
            tracing::info!(namespace = %self.namespace, attempt, ?source, dst = %dst.display(), "fetching checkpoint");
            self.files.transfer(&source, &dst, cancel).await?;
        }
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.restore(term, index))
            .await
            .context("restore task")?
    }

    async fn lookup_peers(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<SnapshotSyncInfo>> {
        let mut last_err = anyhow!("peer lookup not attempted");
        for attempt in 0..PEER_LOOKUP_RETRIES {
            match self.cluster.snapshot_sync_info(&self.namespace).await {
                Ok(peers) => return Ok(peers),
                Err(err) => {
                    tracing::info!(namespace = %self.namespace, attempt, error = ?err, "snapshot sync info lookup failed");
                    last_err = err;
                }
            }
            if attempt + 1 < PEER_LOOKUP_RETRIES {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(last_err),
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }
        Err(last_err.context("query snapshot sync info"))
    }

    fn source_for(&self, peer: &SnapshotSyncInfo, term: u64, index: u64) -> Option<SyncSource> {
        if peer.replica_id == self.replica_id {
            return None;
        }
        let name = engine::checkpoint_dir_name(term, index);
        if peer.remote_addr == self.broadcast_addr {
            // Same host: only a different data root can hold a distinct copy.
            if peer.data_root == self.data_root {
                return None;
            }
            let ns_root = peer.data_root.join(&self.namespace);
            return Some(SyncSource::Local {
                path: engine::backup_dir(&ns_root).join(name),
            });
        }
        Some(SyncSource::Remote {
            addr: peer.remote_addr.clone(),
            path: format!(
                "{}/{}/{}/{}",
                peer.rsync_module,
                self.namespace,
                engine::BACKUP_DIR,
                name
            ),
        })
    }

    async fn pick_source(
        &self,
        attempt: usize,
        term: u64,
        index: u64,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SyncSource> {
        let peers = self.lookup_peers(cancel).await?;
        let mut candidates = Vec::new();
        for peer in &peers {
            let Some(source) = self.source_for(peer, term, index) else {
                continue;
            };
            match self
                .cluster
                .check_backup(peer, &self.namespace, term, index)
                .await
            {
                Ok(true) => candidates.push(source),
                Ok(false) => {
                    tracing::debug!(replica = peer.replica_id, term, index, "peer lacks checkpoint");
                }
                Err(err) => {
                    tracing::debug!(replica = peer.replica_id, error = ?err, "peer backup check failed");
                }
            }
        }
        anyhow::ensure!(
            !candidates.is_empty(),
            "no peer holds checkpoint {} for namespace {}",
            engine::checkpoint_dir_name(term, index),
            self.namespace
        );
        let pick = attempt % candidates.len();
        Ok(candidates.swap_remove(pick))
    }
}
