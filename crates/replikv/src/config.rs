use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "replikv")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node.
    Node(NodeArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct NodeArgs {
    /// Replica id advertised to peers; must be unique per namespace.
    #[arg(long, env = "REPLIKV_NODE_ID", default_value_t = 1)]
    pub node_id: u64,

    #[arg(long, env = "REPLIKV_REDIS_ADDR", default_value = "127.0.0.1:6379")]
    pub redis_addr: SocketAddr,

    /// Listen address of the snapshot-info service.
    #[arg(long, env = "REPLIKV_SNAPSHOT_ADDR", default_value = "127.0.0.1:7379")]
    pub snapshot_addr: SocketAddr,

    /// Host peers use to reach this node's rsync daemon.
    #[arg(long, env = "REPLIKV_BROADCAST_ADDR", default_value = "127.0.0.1")]
    pub broadcast_addr: String,

    #[arg(long, env = "REPLIKV_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "REPLIKV_RSYNC_MODULE", default_value = "replikv")]
    pub rsync_module: String,

    #[arg(
        long,
        env = "REPLIKV_NAMESPACES",
        value_delimiter = ',',
        default_value = "default"
    )]
    pub namespaces: Vec<String>,

    /// Snapshot-info service addresses of the other nodes.
    #[arg(long, env = "REPLIKV_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Upper bound on commands grouped into one storage transaction.
    #[arg(long, env = "REPLIKV_MAX_BATCH_CMDS", default_value_t = 500)]
    pub max_batch_cmds: usize,

    #[arg(long, env = "REPLIKV_PROPOSE_TIMEOUT_MS", default_value_t = 5000)]
    pub propose_timeout_ms: u64,

    /// How long the sequencer waits for more proposals before cutting a batch.
    #[arg(long, env = "REPLIKV_BATCH_WAIT_US", default_value_t = 200)]
    pub batch_wait_us: u64,
}

impl NodeArgs {
    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_micros(self.batch_wait_us)
    }

    /// Peer list used for snapshot discovery, always including this node.
    pub fn snapshot_peers(&self) -> Vec<String> {
        let own = self.snapshot_addr.to_string();
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !peers.contains(&own) {
            peers.push(own);
        }
        peers
    }
}
