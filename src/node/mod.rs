//! Node runtime: the local store, the outbound transport handle, and the
//! façade that pumps the inbound message queue into the protocol handlers.

pub mod store;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::StoreError;
use crate::membership::FailureCoordinator;
use crate::metrics::PerformanceMonitor;
use crate::net::{Endpoint, Liveness};
use crate::protocol::cache::ReadCache;
use crate::protocol::chain::ChainReplication;
use crate::protocol::message::{Message, MessageKind, NodeId};
use crate::protocol::quorum::QuorumReplication;
use crate::protocol::router::HybridRouter;

pub use store::KvStore;

/// Shared, non-owning view of the node that protocols hold. The node owns
/// the protocols; protocols hold only this handle, so ownership stays a
/// DAG.
pub struct NodeCore {
    pub node_id: NodeId,
    pub store: KvStore,
    endpoint: Endpoint,
    running: AtomicBool,
    sequence: AtomicU64,
}

impl NodeCore {
    pub fn new(node_id: NodeId, endpoint: Endpoint) -> NodeCore {
        NodeCore {
            node_id,
            store: KvStore::new(),
            endpoint,
            running: AtomicBool::new(true),
            sequence: AtomicU64::new(1),
        }
    }

    /// Send an encoded payload to a peer.
    pub fn send_raw(&self, target: NodeId, payload: String) -> Result<(), StoreError> {
        self.endpoint.send_to(target, payload)
    }

    /// Broadcast an encoded payload to every reachable peer.
    pub fn broadcast_raw(&self, payload: &str) -> usize {
        self.endpoint.broadcast(payload)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        self.endpoint.recv_timeout(timeout)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.endpoint.peers()
    }

    /// Next chain sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

/// A replicated KV node: store, protocols, router, and the inbound
/// dispatch loop.
pub struct Node {
    core: Arc<NodeCore>,
    pub chain: Arc<ChainReplication>,
    pub quorum: Arc<QuorumReplication>,
    pub router: Arc<HybridRouter>,
    pub coordinator: Arc<FailureCoordinator>,
    pub monitor: Arc<PerformanceMonitor>,
    liveness: Arc<Liveness>,
    config: NodeConfig,
    dispatch_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl Node {
    /// Wire up a node from its transport endpoint and the full cluster
    /// membership (self included). Chain order and quorum membership both
    /// start as the sorted cluster list.
    pub fn new(config: NodeConfig, endpoint: Endpoint, mut cluster: Vec<NodeId>) -> Node {
        cluster.sort_unstable();
        cluster.dedup();

        let peers: Vec<NodeId> = cluster
            .iter()
            .copied()
            .filter(|&id| id != config.node_id)
            .collect();

        let core = Arc::new(NodeCore::new(config.node_id, endpoint));
        let monitor = Arc::new(PerformanceMonitor::new());
        let chain = Arc::new(ChainReplication::new(core.clone(), cluster.clone()));
        let quorum = Arc::new(QuorumReplication::new(core.clone(), cluster.clone()));
        quorum.set_operation_timeout(config.operation_timeout);
        chain.enable_batching(config.chain_batching);
        chain.set_send_retries(config.send_retries);

        let cache = ReadCache::new(config.cache_ttl, config.cache_capacity);
        let router = Arc::new(HybridRouter::new(
            core.clone(),
            chain.clone(),
            quorum.clone(),
            monitor.clone(),
            cache,
            cluster.len(),
        ));
        router.set_read_preference(config.mode);
        router.set_write_preference(config.mode);

        let coordinator = Arc::new(FailureCoordinator::new(
            chain.clone(),
            quorum.clone(),
            router.clone(),
        ));
        let liveness = Arc::new(Liveness::new(&peers, config.heartbeat_interval * 3));

        Node {
            core,
            chain,
            quorum,
            router,
            coordinator,
            monitor,
            liveness,
            config,
            dispatch_handle: None,
            heartbeat_handle: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    pub fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Spawn the inbound dispatch thread and the heartbeat/maintenance
    /// thread.
    pub fn start(&mut self) {
        if self.dispatch_handle.is_some() {
            return;
        }
        self.core.set_running(true);

        let core = self.core.clone();
        let chain = self.chain.clone();
        let quorum = self.quorum.clone();
        let coordinator = self.coordinator.clone();
        let liveness = self.liveness.clone();
        let detect_failures = self.config.detect_failures;
        self.dispatch_handle = Some(thread::spawn(move || {
            dispatch_loop(core, chain, quorum, coordinator, liveness, detect_failures);
        }));

        let core = self.core.clone();
        let chain = self.chain.clone();
        let quorum = self.quorum.clone();
        let monitor = self.monitor.clone();
        let coordinator = self.coordinator.clone();
        let liveness = self.liveness.clone();
        let interval = self.config.heartbeat_interval;
        let operation_timeout = self.config.operation_timeout;
        let detect_failures = self.config.detect_failures;
        self.heartbeat_handle = Some(thread::spawn(move || {
            heartbeat_loop(
                core,
                chain,
                quorum,
                monitor,
                coordinator,
                liveness,
                interval,
                operation_timeout,
                detect_failures,
            );
        }));

        info!(node = self.core.node_id, "node started");
    }

    /// Flip the running flag and join both threads. In-flight operations
    /// observe `Shutdown`.
    pub fn stop(&mut self) {
        if !self.core.is_running() {
            return;
        }
        self.core.set_running(false);
        if let Some(handle) = self.dispatch_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            let _ = handle.join();
        }
        info!(node = self.core.node_id, "node stopped");
    }

    pub fn read(&self, key: &str) -> Result<Message, StoreError> {
        self.router.read(key)
    }

    pub fn write(&self, key: &str, value: &str) -> Result<Message, StoreError> {
        self.router.write(key, value)
    }

    pub fn delete(&self, key: &str) -> Result<Message, StoreError> {
        self.router.delete(key)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Dequeue raw payloads and dispatch on message kind. Undecodable payloads
/// are logged and dropped.
fn dispatch_loop(
    core: Arc<NodeCore>,
    chain: Arc<ChainReplication>,
    quorum: Arc<QuorumReplication>,
    coordinator: Arc<FailureCoordinator>,
    liveness: Arc<Liveness>,
    detect_failures: bool,
) {
    while core.is_running() {
        let Some(payload) = core.recv_timeout(Duration::from_millis(50)) else {
            continue;
        };
        let message = match Message::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(node = core.node_id, %err, "dropping undecodable message");
                continue;
            }
        };

        let recovered = liveness.observe(message.sender);
        if recovered && detect_failures {
            coordinator.handle_node_recovery(message.sender);
        }

        match message.kind {
            MessageKind::ReadRequest => {
                let _ = chain.process_read(&message);
            }
            MessageKind::WriteRequest => {
                let _ = chain.process_write(&message);
            }
            MessageKind::ReadResponse | MessageKind::WriteResponse => {
                debug!(
                    node = core.node_id,
                    from = message.sender,
                    success = message.success,
                    "remote response received"
                );
            }
            MessageKind::Heartbeat => {}
            MessageKind::NodeFailure => {
                if let Some(&failed) = message.target_nodes.first() {
                    coordinator.handle_node_failure(failed);
                }
            }
            MessageKind::NodeRecovery => {
                if let Some(&recovered) = message.target_nodes.first() {
                    coordinator.handle_node_recovery(recovered);
                }
            }
            MessageKind::ChainUpdate => {
                chain.update_chain_order(message.target_nodes.clone());
            }
            MessageKind::ChainForward => {
                let _ = chain.handle_forward(&message);
            }
            MessageKind::ChainAck => {
                chain.handle_ack(&message);
            }
            MessageKind::QuorumPrepare => quorum.handle_prepare(&message),
            MessageKind::QuorumPromise => quorum.handle_promise(&message),
            MessageKind::QuorumAccept => quorum.handle_accept(&message),
            MessageKind::QuorumAccepted => quorum.handle_accepted(&message),
            MessageKind::QuorumAbort => quorum.handle_abort(&message),
            MessageKind::ModeSwitch
            | MessageKind::QuorumCommit
            | MessageKind::CacheUpdate
            | MessageKind::BatchRequest
            | MessageKind::BatchResponse => {
                // Reserved coordination kinds: accepted, no local action.
                debug!(node = core.node_id, kind = ?message.kind, "reserved message kind");
            }
        }
    }
}

/// Emit heartbeats and run periodic maintenance: batch flush, proposal and
/// pending-write expiry, metrics retention, failure detection.
#[allow(clippy::too_many_arguments)]
fn heartbeat_loop(
    core: Arc<NodeCore>,
    chain: Arc<ChainReplication>,
    quorum: Arc<QuorumReplication>,
    monitor: Arc<PerformanceMonitor>,
    coordinator: Arc<FailureCoordinator>,
    liveness: Arc<Liveness>,
    interval: Duration,
    operation_timeout: Duration,
    detect_failures: bool,
) {
    while core.is_running() {
        thread::sleep(interval);
        if !core.is_running() {
            break;
        }

        let heartbeat = Message::new(MessageKind::Heartbeat, core.node_id);
        core.broadcast_raw(&heartbeat.encode());

        chain.maybe_flush_batch();
        chain.expire_pending(operation_timeout);
        quorum.cleanup_expired_proposals();
        monitor.sweep_old_operations();

        if detect_failures {
            for failed in liveness.newly_failed() {
                coordinator.handle_node_failure(failed);
                let mut notice = Message::new(MessageKind::NodeFailure, core.node_id);
                notice.target_nodes = vec![failed];
                core.broadcast_raw(&notice.encode());
            }
        }
    }
}
