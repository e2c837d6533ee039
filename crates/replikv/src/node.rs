//! A node: every configured namespace with its store, state machine and
//! proposer, plus routing of wire commands onto them.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::command::{encode_command, Command, Reply};
use crate::config::NodeArgs;
use crate::engine::KvStore;
use crate::error::KvError;
use crate::index::{HsetIndex, IndexCondition, IndexValueType};
use crate::proposer::{LocalProposer, ProposerOptions};
use crate::snapshot::{RsyncFileSync, SnapshotSyncInfo, SnapshotSyncer};
use crate::snapshot_service::{PeerClusterInfo, SnapshotInfoProvider};
use crate::state_machine::{KvStateMachine, StateMachineOptions};
use crate::types::{ControlRequest, EntryKind, SchemaChange, SchemaChangeKind, SnapshotDescriptor, StateMachine};
use crate::wait::PendingRegistry;
use crate::{read_env_usize, redis_server, snapshot_service};

const DEFAULT_PEER_TIMEOUT_MS: usize = 2000;

pub struct NamespaceHandle {
    pub sm: Arc<KvStateMachine>,
    pub proposer: Arc<LocalProposer>,
}

impl NamespaceHandle {
    async fn propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<Reply, KvError> {
        if !self.sm.is_operational() {
            return Err(KvError::Snapshot(format!(
                "namespace {} is waiting for a snapshot restore",
                self.sm.namespace()
            )));
        }
        self.proposer.propose(kind, data).await
    }
}

pub struct Node {
    replica_id: u64,
    broadcast_addr: String,
    api_addr: String,
    rsync_module: String,
    data_root: PathBuf,
    namespaces: BTreeMap<String, NamespaceHandle>,
    cancel: CancellationToken,
}

impl Node {
    /// Open every namespace and start its proposer. Must run inside a tokio
    /// runtime.
    pub fn open(args: &NodeArgs, cancel: CancellationToken) -> anyhow::Result<Arc<Self>> {
        let peer_timeout = Duration::from_millis(
            read_env_usize("REPLIKV_PEER_TIMEOUT_MS", DEFAULT_PEER_TIMEOUT_MS) as u64,
        );
        let cluster = Arc::new(PeerClusterInfo::new(args.snapshot_peers(), peer_timeout));
        let files = Arc::new(RsyncFileSync);

        let mut namespaces = BTreeMap::new();
        for name in &args.namespaces {
            let name = name.trim();
            anyhow::ensure!(
                !name.is_empty() && !name.contains(':'),
                "invalid namespace name {name:?}"
            );
            if namespaces.contains_key(name) {
                continue;
            }
            let store = Arc::new(
                KvStore::open(args.data_dir.join(name))
                    .with_context(|| format!("open namespace {name}"))?,
            );
            let pending = Arc::new(PendingRegistry::new());
            let syncer = SnapshotSyncer::new(
                name,
                args.node_id,
                args.broadcast_addr.clone(),
                args.data_dir.clone(),
                store.clone(),
                cluster.clone(),
                files.clone(),
            );
            let sm = Arc::new(KvStateMachine::new(
                name,
                args.node_id,
                store,
                pending.clone(),
                syncer,
                StateMachineOptions {
                    max_batch_cmds: args.max_batch_cmds,
                    propose_timeout: args.propose_timeout(),
                },
            )?);
            let proposer = LocalProposer::start(
                sm.clone(),
                pending,
                ProposerOptions {
                    max_batch: args.max_batch_cmds,
                    batch_wait: args.batch_wait(),
                    propose_timeout: args.propose_timeout(),
                },
                cancel.child_token(),
            );
            let (term, index) = sm.applied_position();
            tracing::info!(namespace = %name, term, index, "namespace opened");
            namespaces.insert(name.to_string(), NamespaceHandle { sm, proposer });
        }
        anyhow::ensure!(!namespaces.is_empty(), "no namespaces configured");

        Ok(Arc::new(Self {
            replica_id: args.node_id,
            broadcast_addr: args.broadcast_addr.clone(),
            api_addr: args.snapshot_addr.to_string(),
            rsync_module: args.rsync_module.clone(),
            data_root: args.data_dir.clone(),
            namespaces,
            cancel,
        }))
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceHandle> {
        self.namespaces.get(name)
    }

    fn handle(&self, name: &str) -> Result<&NamespaceHandle, KvError> {
        self.namespace(name)
            .ok_or_else(|| KvError::InvalidCommand(format!("unknown namespace '{name}'")))
    }

    /// Whether the command is applied through the log.
    pub fn is_write(&self, parts: &[Vec<u8>]) -> bool {
        let Some(name) = parts.first() else {
            return false;
        };
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        match name.as_str() {
            "backup" | "hidx.create" | "hidx.drop" => true,
            _ => self
                .namespaces
                .values()
                .next()
                .is_some_and(|ns| ns.sm.router().is_write(&name)),
        }
    }

    /// Run one wire command. `parts[0]` is the command name.
    pub async fn execute(&self, parts: Vec<Vec<u8>>) -> Result<Reply, KvError> {
        let Some(first) = parts.first() else {
            return Err(KvError::InvalidCommand("empty command".to_string()));
        };
        let name = String::from_utf8_lossy(first).to_ascii_lowercase();
        match name.as_str() {
            "ping" => Ok(Reply::Status("PONG".to_string())),
            "info" => Ok(Reply::bulk(self.info())),
            "backup" => self.backup(&parts).await,
            "hidx.create" => self.create_index(&parts).await,
            "hidx.drop" => self.drop_index(&parts).await,
            "hidx.search" => self.search_index(&parts),
            "snapshot.restore" => self.restore(&parts).await,
            _ => self.data_command(&name, parts).await,
        }
    }

    async fn data_command(&self, name: &str, parts: Vec<Vec<u8>>) -> Result<Reply, KvError> {
        let mut parts = parts.into_iter().skip(1);
        let key = parts.next().ok_or_else(|| KvError::wrong_args(name))?;
        let (ns, pk) = split_namespace(&key)?;
        let handle = self.handle(ns)?;
        let router = handle.sm.router();
        if router.get(name).is_none() {
            return Err(KvError::InvalidCommand(format!("unknown command '{name}'")));
        }

        let mut args = Vec::with_capacity(parts.len() + 1);
        args.push(pk.to_vec());
        args.extend(parts);
        let cmd = Command::new(name, args);
        if router.is_write(name) {
            handle.propose(EntryKind::Command, encode_command(&cmd)).await
        } else {
            handle.sm.execute_read(&cmd)
        }
    }

    async fn backup(&self, parts: &[Vec<u8>]) -> Result<Reply, KvError> {
        if parts.len() != 2 {
            return Err(KvError::wrong_args("backup"));
        }
        let handle = self.handle(arg_str(parts, 1)?)?;
        let payload = serde_json::to_vec(&ControlRequest::backup())
            .map_err(|err| KvError::Decode(err.to_string()))?;
        handle.propose(EntryKind::ControlBackup, payload).await
    }

    /// `HIDX.CREATE ns:table name field [UNIQUE] [STRING|INT64]`
    async fn create_index(&self, parts: &[Vec<u8>]) -> Result<Reply, KvError> {
        if parts.len() < 4 {
            return Err(KvError::wrong_args("hidx.create"));
        }
        let (handle, table) = self.table_arg(parts)?;
        let mut index = HsetIndex {
            table: table.to_string(),
            name: arg_str(parts, 2)?.to_string(),
            index_field: arg_str(parts, 3)?.to_string(),
            unique: false,
            value_type: IndexValueType::String,
        };
        for idx in 4..parts.len() {
            match arg_str(parts, idx)?.to_ascii_uppercase().as_str() {
                "UNIQUE" => index.unique = true,
                "STRING" => index.value_type = IndexValueType::String,
                "INT64" => index.value_type = IndexValueType::Int64,
                other => {
                    return Err(KvError::InvalidCommand(format!(
                        "unknown index option '{other}'"
                    )))
                }
            }
        }
        let change = SchemaChange {
            kind: SchemaChangeKind::AddHsetIndex,
            table: table.to_string(),
            index,
        };
        let payload = serde_json::to_vec(&change).map_err(|err| KvError::Decode(err.to_string()))?;
        handle.propose(EntryKind::ControlSchema, payload).await
    }

    /// `HIDX.DROP ns:table field`
    async fn drop_index(&self, parts: &[Vec<u8>]) -> Result<Reply, KvError> {
        if parts.len() != 3 {
            return Err(KvError::wrong_args("hidx.drop"));
        }
        let (handle, table) = self.table_arg(parts)?;
        let index = handle
            .sm
            .indexes()
            .get_index(table, arg_str(parts, 2)?)
            .ok_or(KvError::NoSuchIndex)?;
        let change = SchemaChange {
            kind: SchemaChangeKind::DeleteHsetIndex,
            table: table.to_string(),
            index,
        };
        let payload = serde_json::to_vec(&change).map_err(|err| KvError::Decode(err.to_string()))?;
        handle.propose(EntryKind::ControlSchema, payload).await
    }

    /// `HIDX.SEARCH ns:table field [GT|GTE v] [LT|LTE v] [OFFSET n] [LIMIT n] [ASC|DESC]`
    fn search_index(&self, parts: &[Vec<u8>]) -> Result<Reply, KvError> {
        if parts.len() < 3 {
            return Err(KvError::wrong_args("hidx.search"));
        }
        let (handle, table) = self.table_arg(parts)?;
        let ns = handle.sm.namespace();
        let field = arg_str(parts, 2)?;

        let mut cond = IndexCondition::default();
        let mut reverse = false;
        let mut idx = 3;
        while idx < parts.len() {
            let opt = arg_str(parts, idx)?.to_ascii_uppercase();
            match opt.as_str() {
                "ASC" => {
                    reverse = false;
                    idx += 1;
                    continue;
                }
                "DESC" => {
                    reverse = true;
                    idx += 1;
                    continue;
                }
                _ => {}
            }
            let value = parts
                .get(idx + 1)
                .ok_or_else(|| KvError::InvalidCommand(format!("{opt} needs a value")))?;
            match opt.as_str() {
                "GT" | "GTE" => {
                    cond.start_key = Some(value.clone());
                    cond.include_start = opt == "GTE";
                }
                "LT" | "LTE" => {
                    cond.end_key = Some(value.clone());
                    cond.include_end = opt == "LTE";
                }
                "OFFSET" => {
                    cond.offset = arg_str(parts, idx + 1)?
                        .parse()
                        .map_err(|_| KvError::InvalidCommand("OFFSET is not a count".to_string()))?;
                }
                "LIMIT" => {
                    cond.limit = arg_str(parts, idx + 1)?
                        .parse()
                        .map_err(|_| KvError::InvalidCommand("LIMIT is not an integer".to_string()))?;
                }
                other => {
                    return Err(KvError::InvalidCommand(format!(
                        "unknown search option '{other}'"
                    )))
                }
            }
            idx += 2;
        }

        let (count, pks) = handle.sm.search_index(table, field, &cond, reverse)?;
        let mut items = Vec::with_capacity(pks.len() + 1);
        items.push(Reply::Int(count as i64));
        for pk in pks {
            let mut key = Vec::with_capacity(ns.len() + 1 + pk.len());
            key.extend_from_slice(ns.as_bytes());
            key.push(b':');
            key.extend_from_slice(&pk);
            items.push(Reply::Bulk(key));
        }
        Ok(Reply::Array(items))
    }

    /// `SNAPSHOT.RESTORE ns term index`
    async fn restore(&self, parts: &[Vec<u8>]) -> Result<Reply, KvError> {
        if parts.len() != 4 {
            return Err(KvError::wrong_args("snapshot.restore"));
        }
        let handle = self.handle(arg_str(parts, 1)?)?;
        let term = parse_u64(parts, 2, "term")?;
        let index = parse_u64(parts, 3, "index")?;
        let desc = SnapshotDescriptor {
            replica_id: self.replica_id,
            term,
            index,
            checkpoint_dir: handle.sm.store().checkpoint_path(term, index),
        };
        handle
            .sm
            .restore(false, &desc, &self.cancel)
            .await
            .map_err(|err| KvError::Snapshot(format!("{err:#}")))?;
        Ok(Reply::ok())
    }

    /// Resolve the namespace and table of a `ns:table` argument.
    fn table_arg<'a>(&'a self, parts: &'a [Vec<u8>]) -> Result<(&'a NamespaceHandle, &'a str), KvError> {
        let qualified = arg_str(parts, 1)?;
        let (ns, table) = qualified
            .split_once(':')
            .ok_or_else(|| KvError::InvalidCommand(format!("expected namespace:table, got '{qualified}'")))?;
        if table.is_empty() || table.contains(':') {
            return Err(KvError::InvalidCommand(format!("invalid table name '{table}'")));
        }
        Ok((self.handle(ns)?, table))
    }

    pub fn info(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "# Server\r\nreplica_id:{}\r\nnamespaces:{}\r\n",
            self.replica_id,
            self.namespaces.len()
        );
        for (name, handle) in &self.namespaces {
            let (term, index) = handle.sm.applied_position();
            let _ = write!(
                out,
                "\r\n# Namespace {name}\r\noperational:{}\r\napplied_term:{term}\r\napplied_index:{index}\r\nindex_tables:{}\r\npending:{}\r\n",
                u8::from(handle.sm.is_operational()),
                handle.sm.indexes().table_count(),
                handle.sm.pending().len(),
            );
            for (field, value) in handle.sm.stats().fields() {
                let _ = write!(out, "{field}:{value}\r\n");
            }
        }
        out
    }
}

impl SnapshotInfoProvider for Node {
    fn sync_info(&self, namespace: &str) -> Option<SnapshotSyncInfo> {
        self.namespace(namespace)?;
        Some(SnapshotSyncInfo {
            replica_id: self.replica_id,
            remote_addr: self.broadcast_addr.clone(),
            api_addr: self.api_addr.clone(),
            rsync_module: self.rsync_module.clone(),
            data_root: self.data_root.clone(),
        })
    }

    fn check_backup(&self, namespace: &str, term: u64, index: u64) -> bool {
        self.namespace(namespace)
            .is_some_and(|handle| handle.sm.store().is_local_backup_ok(term, index))
    }
}

/// Split `ns:rest` into the namespace and the primary key.
fn split_namespace(key: &[u8]) -> Result<(&str, &[u8]), KvError> {
    let pos = key
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| KvError::InvalidCommand("key has no namespace prefix".to_string()))?;
    let ns = std::str::from_utf8(&key[..pos])
        .map_err(|_| KvError::InvalidCommand("namespace is not utf-8".to_string()))?;
    Ok((ns, &key[pos + 1..]))
}

fn arg_str(parts: &[Vec<u8>], idx: usize) -> Result<&str, KvError> {
    let raw = parts
        .get(idx)
        .ok_or_else(|| KvError::InvalidCommand(format!("missing argument {idx}")))?;
    std::str::from_utf8(raw).map_err(|_| KvError::InvalidCommand(format!("argument {idx} is not utf-8")))
}

fn parse_u64(parts: &[Vec<u8>], idx: usize, what: &str) -> Result<u64, KvError> {
    arg_str(parts, idx)?
        .parse()
        .map_err(|_| KvError::InvalidCommand(format!("{what} is not an unsigned integer")))
}

/// Start a node and serve until Ctrl-C.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Start a node and serve until `shutdown` resolves or a listener fails.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = Result<(), std::io::Error>> + Send,
{
    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let cancel = CancellationToken::new();
    let node = Node::open(&args, cancel.clone())?;

    let mut redis = tokio::spawn(redis_server::run(args.redis_addr, node.clone()));
    let mut snapshot = tokio::spawn(snapshot_service::run(args.snapshot_addr, node.clone()));
    tracing::info!(
        node_id = args.node_id,
        redis_addr = %args.redis_addr,
        snapshot_addr = %args.snapshot_addr,
        namespaces = ?args.namespaces,
        "node started"
    );

    let outcome = tokio::select! {
        res = shutdown => res.context("wait for shutdown signal"),
        res = &mut redis => task_outcome(res, "redis server"),
        res = &mut snapshot => task_outcome(res, "snapshot service"),
    };
    cancel.cancel();
    redis.abort();
    snapshot.abort();
    tracing::info!(node_id = args.node_id, "node stopped");
    outcome
}

fn task_outcome(res: Result<anyhow::Result<()>, JoinError>, what: &str) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => anyhow::bail!("{what} exited"),
        Ok(Err(err)) => Err(err.context(format!("{what} failed"))),
        Err(err) => anyhow::bail!("{what} task failed: {err}"),
    }
}
