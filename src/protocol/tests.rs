//! Cluster integration tests: full nodes on real threads, wired through
//! the channel transport.

use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::protocol::message::{Message, MessageKind, NodeId, ReplicationMode};
use crate::protocol::router::{AdaptiveMetrics, WorkloadPattern};
use crate::workload::Cluster;

fn launch(ids: &[NodeId], mode: ReplicationMode) -> Cluster {
    Cluster::launch(ids, |config| {
        config.mode = mode;
        config.detect_failures = false;
        config.operation_timeout = Duration::from_secs(2);
        config.heartbeat_interval = Duration::from_millis(100);
    })
}

/// Poll until `condition` holds or `timeout` passes.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn metrics(
    ratio: f64,
    partition: f64,
    nodes: usize,
    pattern: WorkloadPattern,
) -> AdaptiveMetrics {
    AdaptiveMetrics {
        read_write_ratio: ratio,
        average_latency_ms: 10.0,
        throughput_ops_per_sec: 1.0,
        network_partition_probability: partition,
        active_nodes: nodes,
        pattern,
    }
}

// =============================================================================
// CHAIN SCENARIOS
// =============================================================================

#[test]
fn chain_write_reaches_tail_before_ack_returns() {
    let cluster = launch(&[1, 2, 3], ReplicationMode::ChainOnly);
    let head = cluster.node(1);

    let response = head.write("k", "v").unwrap();
    assert!(response.success);

    // The ack is consumed asynchronously; once the head's pending entry is
    // cleared, the value must already be on the tail.
    assert!(wait_until(Duration::from_secs(2), || {
        head.chain.pending_count() == 0
    }));
    assert_eq!(cluster.node(3).core().store.read("k"), Some("v".to_string()));

    // S1: a read routed to the tail returns the written value.
    let read = cluster.node(3).read("k").unwrap();
    assert!(read.success);
    assert_eq!(read.value, "v");
}

#[test]
fn two_node_chain_ack_returns_directly_to_head() {
    let cluster = launch(&[1, 2], ReplicationMode::ChainOnly);
    let head = cluster.node(1);

    let response = head.write("pair", "x").unwrap();
    assert!(response.success);
    assert!(wait_until(Duration::from_secs(2), || {
        head.chain.pending_count() == 0
    }));
    assert_eq!(cluster.node(2).core().store.read("pair"), Some("x".to_string()));
}

#[test]
fn non_tail_read_is_forwarded_and_served_remotely() {
    let cluster = launch(&[1, 2, 3], ReplicationMode::ChainOnly);
    cluster.node(1).write("k", "v").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        cluster.node(3).core().store.contains("k")
    }));

    // A read at the head reports a local non-success; the tail replies to
    // the original sender out of band.
    let response = cluster.node(1).read("k").unwrap();
    assert!(!response.success);
    assert_eq!(response.metadata, "forwarded");
}

// =============================================================================
// QUORUM SCENARIOS
// =============================================================================

#[test]
fn quorum_write_commits_on_majority() {
    let cluster = launch(&[1, 2, 3, 4, 5], ReplicationMode::QuorumOnly);
    let proposer = cluster.node(1);
    assert_eq!(proposer.quorum.quorum_size(), 3);

    let response = proposer.write("x", "1").unwrap();
    assert!(response.success);

    // S2: at least quorum_size members hold the value.
    let holders = [1, 2, 3, 4, 5]
        .iter()
        .filter(|&&id| cluster.node(id).core().store.read("x") == Some("1".to_string()))
        .count();
    assert!(holders >= 3, "only {holders} members hold the value");
}

#[test]
fn quorum_write_then_read_returns_value() {
    let cluster = launch(&[1, 2, 3], ReplicationMode::QuorumOnly);
    let node = cluster.node(1);
    node.write("k", "v").unwrap();
    let read = node.read("k").unwrap();
    assert!(read.success);
    assert_eq!(read.value, "v");
}

#[test]
fn quorum_write_fails_without_majority() {
    let cluster = launch(&[1, 2, 3, 4, 5], ReplicationMode::QuorumOnly);
    // Cut the proposer off from every peer.
    cluster.net.disconnect(1);

    let result = cluster.node(1).write("x", "1");
    assert_eq!(result, Err(StoreError::NoQuorumAvailable));
    // The failed proposal is gone.
    assert_eq!(cluster.node(1).quorum.active_proposals(), 0);
}

// =============================================================================
// ROUTER / CACHE SCENARIOS
// =============================================================================

#[test]
fn cache_lifecycle_never_serves_stale_values() {
    let cluster = launch(&[1], ReplicationMode::ChainOnly);
    let node = cluster.node(1);
    let router = &node.router;

    // Miss on empty store.
    assert_eq!(node.read("k"), Err(StoreError::KeyNotFound));

    node.write("k", "a").unwrap();
    // Dispatch fills the cache.
    assert_eq!(node.read("k").unwrap().value, "a");
    let hits = router.cache_hits();
    // Cache hit, no dispatch.
    assert_eq!(node.read("k").unwrap().value, "a");
    assert_eq!(router.cache_hits(), hits + 1);

    // The write evicts before dispatch, so the next read misses the cache
    // and observes the new value.
    node.write("k", "b").unwrap();
    let hits = router.cache_hits();
    assert_eq!(node.read("k").unwrap().value, "b");
    assert_eq!(router.cache_hits(), hits);
}

#[test]
fn adaptive_selection_follows_telemetry() {
    let cluster = launch(&[1], ReplicationMode::HybridAuto);
    let router = &cluster.node(1).router;

    router.update_workload_metrics(metrics(5.0, 0.1, 5, WorkloadPattern::ReadHeavy));
    assert_eq!(router.select_optimal_mode(), ReplicationMode::ChainOnly);

    router.update_workload_metrics(metrics(0.3, 0.1, 5, WorkloadPattern::WriteHeavy));
    assert_eq!(router.select_optimal_mode(), ReplicationMode::QuorumOnly);

    router.update_workload_metrics(metrics(1.5, 0.1, 4, WorkloadPattern::Balanced));
    assert_eq!(router.select_optimal_mode(), ReplicationMode::HybridAuto);
}

#[test]
fn partition_pins_chain_until_telemetry_clears() {
    let cluster = launch(&[1], ReplicationMode::HybridAuto);
    let router = &cluster.node(1).router;

    router.handle_network_partition();
    assert_eq!(router.current_mode(), ReplicationMode::ChainOnly);

    // Still partitioned: the pin holds even against quorum-favoring load.
    router.update_workload_metrics(metrics(0.3, 0.5, 7, WorkloadPattern::WriteHeavy));
    assert_eq!(router.current_mode(), ReplicationMode::ChainOnly);

    // Partition cleared: re-selection is permitted again.
    router.update_workload_metrics(metrics(0.3, 0.05, 7, WorkloadPattern::WriteHeavy));
    assert_eq!(router.current_mode(), ReplicationMode::QuorumOnly);
}

// =============================================================================
// MEMBERSHIP SCENARIOS
// =============================================================================

#[test]
fn failure_and_recovery_are_atomic_across_protocols() {
    let cluster = launch(&[1, 2, 3, 4, 5], ReplicationMode::HybridAuto);
    let node = cluster.node(1);
    assert_eq!(node.quorum.quorum_size(), 3);

    node.coordinator.handle_node_failure(3);
    assert!(!node.chain.chain_order().contains(&3));
    assert!(!node.quorum.is_member(3));
    assert_eq!(node.quorum.members().len(), 4);
    assert_eq!(node.quorum.quorum_size(), 3);

    node.coordinator.handle_node_recovery(3);
    assert!(node.chain.chain_order().contains(&3));
    assert!(node.quorum.is_member(3));
    assert_eq!(node.quorum.quorum_size(), 3);
}

#[test]
fn chain_survives_mid_node_failure() {
    let cluster = launch(&[1, 2, 3], ReplicationMode::ChainOnly);
    let head = cluster.node(1);

    head.write("before", "1").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        head.chain.pending_count() == 0
    }));

    // Node 2 dies; every survivor updates its membership view.
    cluster.node(1).coordinator.handle_node_failure(2);
    cluster.node(3).coordinator.handle_node_failure(2);
    assert_eq!(head.chain.chain_order(), vec![1, 3]);

    head.write("after", "2").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        cluster.node(3).core().store.contains("after")
    }));
}

#[test]
fn heartbeat_detection_reports_silent_peer() {
    let ids = [1, 2];
    let cluster = Cluster::launch(&ids, |config| {
        config.mode = ReplicationMode::ChainOnly;
        config.detect_failures = true;
        config.heartbeat_interval = Duration::from_millis(50);
    });

    // Node 2 goes silent.
    cluster.net.disconnect(2);
    assert!(wait_until(Duration::from_secs(3), || {
        !cluster.node(1).quorum.is_member(2)
    }));
    assert_eq!(cluster.node(1).chain.chain_order(), vec![1]);

    // Node 2 comes back; its heartbeats restore membership.
    cluster.net.reconnect(2);
    assert!(wait_until(Duration::from_secs(3), || {
        cluster.node(1).quorum.is_member(2)
    }));
}

// =============================================================================
// FAÇADE ROBUSTNESS
// =============================================================================

#[test]
fn malformed_payloads_are_dropped_not_fatal() {
    let cluster = launch(&[1, 2], ReplicationMode::ChainOnly);

    assert!(cluster.net.inject(1, "garbage|not|a|message".to_string()));
    assert!(cluster.net.inject(1, String::new()));

    // The node keeps serving after the bad input.
    cluster.node(1).write("k", "v").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        cluster.node(2).core().store.contains("k")
    }));
}

#[test]
fn stopped_node_reports_shutdown() {
    let ids = [1];
    let mut cluster = launch(&ids, ReplicationMode::ChainOnly);
    cluster.shutdown();
    assert_eq!(cluster.node(1).read("k"), Err(StoreError::Shutdown));
    assert_eq!(cluster.node(1).write("k", "v"), Err(StoreError::Shutdown));
}

#[test]
fn remote_write_request_lands_on_head() {
    let cluster = launch(&[1, 2, 3], ReplicationMode::ChainOnly);

    // A WriteRequest arriving at a non-head node is forwarded to the head,
    // which drives the pipeline.
    let request = Message::request(MessageKind::WriteRequest, 2, "remote", "w");
    assert!(cluster.net.inject(2, request.encode()));

    assert!(wait_until(Duration::from_secs(2), || {
        cluster.node(1).core().store.contains("remote")
            && cluster.node(3).core().store.contains("remote")
    }));
}
