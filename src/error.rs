//! Typed failure taxonomy for replication operations.
//!
//! Protocols translate timeouts and majority misses into these kinds; the
//! router surfaces the sub-protocol's kind unchanged and never retries a
//! failed write on the other protocol (a cross-mode retry could apply the
//! write twice).

use thiserror::Error;

use crate::protocol::message::NodeId;

/// Failure kinds surfaced by the replication engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A read reached its authoritative node and no entry exists.
    #[error("key not found")]
    KeyNotFound,

    /// The proposer could not gather `quorum_size` distinct promises within
    /// the operation timeout, or membership is too small to form a quorum.
    #[error("no quorum available")]
    NoQuorumAvailable,

    /// The accept phase did not reach a majority within the deadline.
    #[error("consensus timed out")]
    ConsensusTimeout,

    /// Forwarding failed after retry exhaustion and no successor could be
    /// reconstituted.
    #[error("chain broken")]
    ChainBroken,

    /// The transport reported delivery failure to a specific peer.
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    /// Deserialization failed or a required field was missing.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The local node is stopping.
    #[error("node shutting down")]
    Shutdown,
}

impl StoreError {
    /// Stable kind name, carried out-of-band in response `metadata`.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::KeyNotFound => "KeyNotFound",
            StoreError::NoQuorumAvailable => "NoQuorumAvailable",
            StoreError::ConsensusTimeout => "ConsensusTimeout",
            StoreError::ChainBroken => "ChainBroken",
            StoreError::Unreachable(_) => "Unreachable",
            StoreError::InvalidMessage(_) => "InvalidMessage",
            StoreError::Shutdown => "Shutdown",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(StoreError::KeyNotFound.kind(), "KeyNotFound");
        assert_eq!(StoreError::Unreachable(7).kind(), "Unreachable");
        assert_eq!(
            StoreError::InvalidMessage("bad".into()).kind(),
            "InvalidMessage"
        );
    }
}
