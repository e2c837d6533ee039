use thiserror::Error;

/// Failure delivered through a completion slot or shown to a client.
///
/// `Clone` so a failed group commit can hand the same error to every entry
/// that was accumulated into it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unrecognized data")]
    UnknownData,
    #[error("no such index")]
    NoSuchIndex,
    #[error("index already exists on {table}.{field}")]
    IndexExists { table: String, field: String },
    #[error("index value type mismatch: {0}")]
    IndexValueType(String),
    #[error("unique index violation on {table}.{field}")]
    UniqueViolation { table: String, field: String },
    #[error("wrong type: {0}")]
    WrongType(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("batch rejected by replication policy")]
    Rejected,
    #[error("request cancelled")]
    Cancelled,
    #[error("timed out waiting for apply")]
    Timeout,
    #[error("node is stopping")]
    Stopped,
}

impl KvError {
    pub fn wrong_args(cmd: &str) -> Self {
        Self::InvalidCommand(format!("wrong number of arguments for '{cmd}' command"))
    }
}

impl From<anyhow::Error> for KvError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

impl From<replikv_geo::GeoError> for KvError {
    fn from(err: replikv_geo::GeoError) -> Self {
        Self::InvalidCommand(err.to_string())
    }
}
