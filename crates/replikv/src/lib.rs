//! Replicated key-value node: grouped batch apply over fjall, hash secondary
//! indexes, geo commands and snapshot catch-up between replicas.

pub mod codec;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod hash;
pub mod index;
pub mod node;
pub mod proposer;
pub mod redis_server;
pub mod replication;
pub mod snapshot;
pub mod snapshot_service;
pub mod state_machine;
pub mod types;
pub mod wait;

pub use config::NodeArgs;
pub use error::KvError;
pub use node::{run_node, run_node_with_shutdown, Node};

/// Tuning knob read from the environment, falling back to `default` when
/// unset or unparsable.
pub fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
