//! Node and benchmark configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::message::{NodeId, ReplicationMode};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

impl ReplicationMode {
    /// Parse the CLI spelling of a mode.
    pub fn parse(raw: &str) -> Option<ReplicationMode> {
        match raw {
            "chain" => Some(ReplicationMode::ChainOnly),
            "quorum" => Some(ReplicationMode::QuorumOnly),
            "hybrid" => Some(ReplicationMode::HybridAuto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplicationMode::ChainOnly => "chain",
            ReplicationMode::QuorumOnly => "quorum",
            ReplicationMode::HybridAuto => "hybrid",
        }
    }
}

/// Runtime configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub port: u16,
    pub peers: Vec<NodeId>,
    #[serde(skip, default = "default_mode")]
    pub mode: ReplicationMode,
    pub operation_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub chain_batching: bool,
    /// Resend attempts on transient send failure before rewiring.
    pub send_retries: u32,
    pub heartbeat_interval: Duration,
    /// Heartbeat-driven failure detection; disable for harnesses that
    /// drive membership changes directly.
    pub detect_failures: bool,
}

fn default_mode() -> ReplicationMode {
    ReplicationMode::HybridAuto
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> NodeConfig {
        NodeConfig {
            node_id,
            port: DEFAULT_PORT,
            peers: Vec::new(),
            mode: ReplicationMode::HybridAuto,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            chain_batching: false,
            send_retries: 3,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            detect_failures: true,
        }
    }

    /// Full cluster membership: peers plus this node, sorted.
    pub fn cluster(&self) -> Vec<NodeId> {
        let mut cluster = self.peers.clone();
        cluster.push(self.node_id);
        cluster.sort_unstable();
        cluster.dedup();
        cluster
    }
}

/// Benchmark driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    pub nodes: usize,
    pub threads: usize,
    /// Operations per thread.
    pub ops: usize,
    /// Fraction of reads in [0, 1].
    pub read_ratio: f64,
    pub key_range: u32,
    pub output: PathBuf,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            nodes: 5,
            threads: 4,
            ops: 1000,
            read_ratio: 0.7,
            key_range: 1000,
            output: PathBuf::from("benchmark_results.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(ReplicationMode::parse("chain"), Some(ReplicationMode::ChainOnly));
        assert_eq!(ReplicationMode::parse("quorum"), Some(ReplicationMode::QuorumOnly));
        assert_eq!(ReplicationMode::parse("hybrid"), Some(ReplicationMode::HybridAuto));
        assert_eq!(ReplicationMode::parse("paxos"), None);
        assert_eq!(ReplicationMode::ChainOnly.as_str(), "chain");
    }

    #[test]
    fn cluster_includes_self_sorted_deduped() {
        let mut config = NodeConfig::new(3);
        config.peers = vec![5, 1, 3];
        assert_eq!(config.cluster(), vec![1, 3, 5]);
    }
}
