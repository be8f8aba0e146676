//! braid: a replicated key-value store with a hybrid replication engine.
//!
//! Each operation is routed through one of two coordination protocols,
//! either a chain-replication pipeline or a majority-quorum consensus,
//! selected per request from live workload telemetry. A TTL cache fronts
//! reads, and
//! a failure coordinator keeps both protocols' membership views aligned as
//! nodes fail and recover.

pub mod config;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod net;
pub mod node;
pub mod protocol;
pub mod telemetry;
pub mod workload;

pub use config::{BenchConfig, NodeConfig};
pub use error::{Result, StoreError};
pub use membership::FailureCoordinator;
pub use metrics::{PerfStats, PerformanceMonitor};
pub use net::{ClusterNet, Endpoint};
pub use node::{KvStore, Node, NodeCore};
pub use protocol::cache::ReadCache;
pub use protocol::chain::ChainReplication;
pub use protocol::message::{Message, MessageKind, NodeId, ReplicationMode};
pub use protocol::quorum::QuorumReplication;
pub use protocol::router::{AdaptiveMetrics, HybridRouter, WorkloadPattern};
pub use workload::Cluster;
