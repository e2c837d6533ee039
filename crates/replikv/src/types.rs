use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::index::HsetIndex;

/// Payload kind tag carried in an entry header.
pub const DATA_TYPE_COMMAND: u8 = 0;
pub const DATA_TYPE_CONTROL_BACKUP: u8 = 1;
pub const DATA_TYPE_CONTROL_SCHEMA: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Command,
    ControlBackup,
    ControlSchema,
}

impl EntryKind {
    pub fn from_data_type(data_type: u8) -> Option<Self> {
        match data_type {
            DATA_TYPE_COMMAND => Some(Self::Command),
            DATA_TYPE_CONTROL_BACKUP => Some(Self::ControlBackup),
            DATA_TYPE_CONTROL_SCHEMA => Some(Self::ControlSchema),
            _ => None,
        }
    }

    pub fn data_type(self) -> u8 {
        match self {
            Self::Command => DATA_TYPE_COMMAND,
            Self::ControlBackup => DATA_TYPE_CONTROL_BACKUP,
            Self::ControlSchema => DATA_TYPE_CONTROL_SCHEMA,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub id: u64,
    pub timestamp: i64,
    pub data_type: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub header: EntryHeader,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(id: u64, timestamp: i64, kind: EntryKind, data: Vec<u8>) -> Self {
        Self {
            header: EntryHeader {
                id,
                timestamp,
                data_type: kind.data_type(),
            },
            data,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchSource {
    /// Proposed by clients of this cluster.
    Local,
    /// Replayed from another cluster's log.
    ClusterSyncer,
}

/// Entries committed together at one `(term, index)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedBatch {
    pub entries: Vec<Entry>,
    /// Completion id for the batch as a whole, resolved after every entry.
    pub batch_id: Option<u64>,
    pub timestamp: i64,
    pub source: BatchSource,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub replica_id: u64,
    pub term: u64,
    pub index: u64,
    pub checkpoint_dir: PathBuf,
}

/// Control-backup payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub op: String,
}

impl ControlRequest {
    pub const BACKUP: &'static str = "backup";

    pub fn backup() -> Self {
        Self {
            op: Self::BACKUP.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangeKind {
    AddHsetIndex,
    DeleteHsetIndex,
}

/// Control-schema payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub kind: SchemaChangeKind,
    pub table: String,
    pub index: HsetIndex,
}

/// What the consensus layer drives.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed batch. Returns true when a forced checkpoint was
    /// requested by one of its entries.
    fn apply_batch(&self, batch: CommittedBatch, term: u64, index: u64) -> bool;

    fn get_snapshot(&self, term: u64, index: u64) -> anyhow::Result<SnapshotDescriptor>;

    async fn restore_from_snapshot(
        &self,
        startup: bool,
        desc: &SnapshotDescriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Last `(term, index)` applied to local state.
    fn applied_position(&self) -> (u64, u64);
}

pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
