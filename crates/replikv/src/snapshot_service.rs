//! Snapshot-info service: one JSON request per line, one JSON response per
//! line. Peers use it to find each other's checkpoints during catch-up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use crate::snapshot::{ClusterInfo, SnapshotSyncInfo};

const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SnapshotRequest {
    SyncInfo { namespace: String },
    CheckBackup { namespace: String, term: u64, index: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SnapshotResponse {
    SyncInfo { info: SnapshotSyncInfo },
    CheckBackup { ok: bool },
    Error { message: String },
}

/// Local answers served to peers.
pub trait SnapshotInfoProvider: Send + Sync + 'static {
    fn sync_info(&self, namespace: &str) -> Option<SnapshotSyncInfo>;
    fn check_backup(&self, namespace: &str, term: u64, index: u64) -> bool;
}

pub async fn run(addr: SocketAddr, provider: Arc<dyn SnapshotInfoProvider>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind snapshot service on {addr}"))?;
    serve(listener, provider).await
}

pub async fn serve(listener: TcpListener, provider: Arc<dyn SnapshotInfoProvider>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let provider = provider.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, provider).await {
                tracing::debug!(%peer, error = ?err, "snapshot service connection closed");
            }
        });
    }
}

fn answer(provider: &dyn SnapshotInfoProvider, line: &str) -> SnapshotResponse {
    let req: SnapshotRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(err) => {
            return SnapshotResponse::Error {
                message: format!("bad request: {err}"),
            }
        }
    };
    match req {
        SnapshotRequest::SyncInfo { namespace } => match provider.sync_info(&namespace) {
            Some(info) => SnapshotResponse::SyncInfo { info },
            None => SnapshotResponse::Error {
                message: format!("namespace {namespace} not served here"),
            },
        },
        SnapshotRequest::CheckBackup {
            namespace,
            term,
            index,
        } => SnapshotResponse::CheckBackup {
            ok: provider.check_backup(&namespace, term, index),
        },
    }
}

async fn handle_conn(socket: TcpStream, provider: Arc<dyn SnapshotInfoProvider>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let resp = answer(provider.as_ref(), &line);
        framed.send(serde_json::to_string(&resp)?).await?;
    }
    Ok(())
}

/// Asks every configured snapshot-service address on each call.
pub struct PeerClusterInfo {
    peers: Vec<String>,
    timeout: Duration,
}

impl PeerClusterInfo {
    pub fn new(peers: Vec<String>, timeout: Duration) -> Self {
        Self { peers, timeout }
    }

    async fn request(&self, addr: &str, req: &SnapshotRequest) -> anyhow::Result<SnapshotResponse> {
        let exchange = async {
            let socket = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connect snapshot service {addr}"))?;
            let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            framed.send(serde_json::to_string(req)?).await?;
            let line = framed
                .next()
                .await
                .ok_or_else(|| anyhow::anyhow!("{addr} closed without answering"))??;
            let resp: SnapshotResponse = serde_json::from_str(&line)
                .with_context(|| format!("parse snapshot service response from {addr}"))?;
            Ok::<_, anyhow::Error>(resp)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .with_context(|| format!("snapshot service {addr} timed out"))?
    }
}

#[async_trait]
impl ClusterInfo for PeerClusterInfo {
    async fn snapshot_sync_info(&self, namespace: &str) -> anyhow::Result<Vec<SnapshotSyncInfo>> {
        let req = SnapshotRequest::SyncInfo {
            namespace: namespace.to_string(),
        };
        let mut infos = Vec::with_capacity(self.peers.len());
        for addr in &self.peers {
            match self.request(addr, &req).await {
                Ok(SnapshotResponse::SyncInfo { info }) => infos.push(info),
                Ok(SnapshotResponse::Error { message }) => {
                    tracing::debug!(peer = %addr, %message, "peer refused sync info");
                }
                Ok(other) => {
                    tracing::debug!(peer = %addr, response = ?other, "unexpected sync info response");
                }
                Err(err) => {
                    tracing::debug!(peer = %addr, error = ?err, "sync info request failed");
                }
            }
        }
        anyhow::ensure!(!infos.is_empty(), "no peer answered sync info for {namespace}");
        Ok(infos)
    }

    async fn check_backup(
        &self,
        peer: &SnapshotSyncInfo,
        namespace: &str,
        term: u64,
        index: u64,
    ) -> anyhow::Result<bool> {
        let req = SnapshotRequest::CheckBackup {
            namespace: namespace.to_string(),
            term,
            index,
        };
        match self.request(&peer.api_addr, &req).await? {
            SnapshotResponse::CheckBackup { ok } => Ok(ok),
            SnapshotResponse::Error { message } => anyhow::bail!("{message}"),
            other => anyhow::bail!("unexpected check_backup response {other:?}"),
        }
    }
}
