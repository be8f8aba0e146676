//! Failure and membership coordination.
//!
//! Heartbeat-driven failure detection funnels through a single entry point
//! that applies each event to the chain and quorum protocols under one
//! guard, so both protocols observe the same membership view at the moment
//! of any routing decision. Lock order inside the guard is fixed: chain
//! first, then consensus.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::protocol::chain::ChainReplication;
use crate::protocol::message::NodeId;
use crate::protocol::quorum::QuorumReplication;
use crate::protocol::router::HybridRouter;

/// Fans failure/recovery events to both protocols atomically.
pub struct FailureCoordinator {
    chain: Arc<ChainReplication>,
    quorum: Arc<QuorumReplication>,
    router: Arc<HybridRouter>,
    guard: Mutex<()>,
}

impl FailureCoordinator {
    pub fn new(
        chain: Arc<ChainReplication>,
        quorum: Arc<QuorumReplication>,
        router: Arc<HybridRouter>,
    ) -> FailureCoordinator {
        FailureCoordinator {
            chain,
            quorum,
            router,
            guard: Mutex::new(()),
        }
    }

    /// Remove a failed node from both protocols. Never silent: always logs
    /// and always updates the router's active-node count.
    pub fn handle_node_failure(&self, failed: NodeId) {
        let _guard = self.guard.lock().unwrap();
        warn!(failed, "node failure: updating chain and quorum membership");
        self.chain.handle_node_failure(failed);
        self.quorum.handle_node_failure(failed);
        self.router.note_node_failed();
    }

    /// Reinstate a recovered node in both protocols.
    pub fn handle_node_recovery(&self, recovered: NodeId) {
        let _guard = self.guard.lock().unwrap();
        info!(recovered, "node recovery: updating chain and quorum membership");
        self.chain.handle_node_recovery(recovered);
        self.quorum.handle_node_recovery(recovered);
        self.router.note_node_recovered();
    }
}
