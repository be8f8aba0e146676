//! The hybrid replication engine: message model, the two protocol state
//! machines, the read cache, and the adaptive router that selects between
//! them per request.

pub mod cache;
pub mod chain;
pub mod message;
pub mod quorum;
pub mod router;

#[cfg(test)]
mod tests;

pub use cache::ReadCache;
pub use chain::ChainReplication;
pub use message::{Message, MessageKind, NodeId, ReplicationMode};
pub use quorum::QuorumReplication;
pub use router::{AdaptiveMetrics, HybridRouter, WorkloadPattern};
