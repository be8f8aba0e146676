//! Adaptive router: per-request protocol selection over the chain and
//! quorum state machines, a read cache in front of both, and mode-switch
//! accounting.
//!
//! Every request snapshots the routing inputs (preferences, telemetry,
//! partition pin) exactly once and never re-reads them mid-dispatch, so a
//! concurrent `update_workload_metrics` cannot split one request across
//! modes. `current_mode` is switch-accounting state only; dispatch always
//! evaluates the per-request heuristics against the snapshot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::metrics::PerformanceMonitor;
use crate::node::NodeCore;
use crate::protocol::cache::ReadCache;
use crate::protocol::chain::ChainReplication;
use crate::protocol::message::{Message, MessageKind, ReplicationMode};
use crate::protocol::quorum::QuorumReplication;

/// Mode switch triggers only when the winning score clears the loser by
/// this margin.
pub const DEFAULT_SWITCHING_THRESHOLD: f64 = 0.15;

/// Retained mode-switch timings for the overhead estimate.
const SWITCH_HISTORY: usize = 256;

/// Weight of a new latency sample in the exponential moving average.
const LATENCY_EMA_WEIGHT: f64 = 0.1;

/// Classification of recent traffic, used as a router input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPattern {
    ReadHeavy,
    WriteHeavy,
    Balanced,
    Bursty,
    Unknown,
}

/// Rolling telemetry snapshot driving mode selection.
#[derive(Debug, Clone)]
pub struct AdaptiveMetrics {
    pub read_write_ratio: f64,
    pub average_latency_ms: f64,
    pub throughput_ops_per_sec: f64,
    /// In [0, 1].
    pub network_partition_probability: f64,
    pub active_nodes: usize,
    pub pattern: WorkloadPattern,
}

impl Default for AdaptiveMetrics {
    fn default() -> Self {
        AdaptiveMetrics {
            read_write_ratio: 1.0,
            average_latency_ms: 0.0,
            throughput_ops_per_sec: 0.0,
            network_partition_probability: 0.0,
            active_nodes: 0,
            pattern: WorkloadPattern::Unknown,
        }
    }
}

struct RouterState {
    mode: ReplicationMode,
    read_preference: ReplicationMode,
    write_preference: ReplicationMode,
    switching_threshold: f64,
    metrics: AdaptiveMetrics,
    /// While set, selection is pinned to chain; cleared by the first
    /// telemetry update reporting partition probability below 0.2.
    partition_pinned: bool,
    switch_times_ms: Vec<f64>,
    read_count: u64,
    write_count: u64,
}

/// One immutable view of the routing inputs, taken per request.
#[derive(Clone)]
struct Decision {
    read_preference: ReplicationMode,
    write_preference: ReplicationMode,
    switching_threshold: f64,
    metrics: AdaptiveMetrics,
    partition_pinned: bool,
}

/// The hybrid replication engine.
pub struct HybridRouter {
    core: Arc<NodeCore>,
    chain: Arc<ChainReplication>,
    quorum: Arc<QuorumReplication>,
    monitor: Arc<PerformanceMonitor>,
    cache: ReadCache,
    state: Mutex<RouterState>,
    adaptive_switching: AtomicBool,
    caching_enabled: AtomicBool,
    chain_operations: AtomicU64,
    quorum_operations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    operation_counter: AtomicU64,
}

impl HybridRouter {
    pub fn new(
        core: Arc<NodeCore>,
        chain: Arc<ChainReplication>,
        quorum: Arc<QuorumReplication>,
        monitor: Arc<PerformanceMonitor>,
        cache: ReadCache,
        active_nodes: usize,
    ) -> HybridRouter {
        let mut metrics = AdaptiveMetrics::default();
        metrics.active_nodes = active_nodes;
        info!(
            node = core.node_id,
            chain_len = chain.chain_len(),
            quorum_members = quorum.members().len(),
            "hybrid router initialized"
        );
        HybridRouter {
            core,
            chain,
            quorum,
            monitor,
            cache,
            state: Mutex::new(RouterState {
                mode: ReplicationMode::HybridAuto,
                read_preference: ReplicationMode::ChainOnly,
                write_preference: ReplicationMode::QuorumOnly,
                switching_threshold: DEFAULT_SWITCHING_THRESHOLD,
                metrics,
                partition_pinned: false,
                switch_times_ms: Vec::new(),
                read_count: 0,
                write_count: 0,
            }),
            adaptive_switching: AtomicBool::new(true),
            caching_enabled: AtomicBool::new(true),
            chain_operations: AtomicU64::new(0),
            quorum_operations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            operation_counter: AtomicU64::new(1),
        }
    }

    pub fn enable_adaptive_switching(&self, enable: bool) {
        self.adaptive_switching.store(enable, Ordering::SeqCst);
    }

    pub fn enable_caching(&self, enable: bool) {
        self.caching_enabled.store(enable, Ordering::SeqCst);
    }

    pub fn set_read_preference(&self, mode: ReplicationMode) {
        self.state.lock().unwrap().read_preference = mode;
    }

    pub fn set_write_preference(&self, mode: ReplicationMode) {
        self.state.lock().unwrap().write_preference = mode;
    }

    pub fn set_switching_threshold(&self, threshold: f64) {
        self.state.lock().unwrap().switching_threshold = threshold;
    }

    fn snapshot(&self) -> Decision {
        let state = self.state.lock().unwrap();
        Decision {
            read_preference: state.read_preference,
            write_preference: state.write_preference,
            switching_threshold: state.switching_threshold,
            metrics: state.metrics.clone(),
            partition_pinned: state.partition_pinned,
        }
    }

    // =========================================================================
    // READ / WRITE
    // =========================================================================

    /// Route a read: cache first, then the selected protocol. Successful
    /// protocol reads refill the cache.
    pub fn read(&self, key: &str) -> Result<Message, StoreError> {
        if !self.core.is_running() {
            return Err(StoreError::Shutdown);
        }
        let request = Message::request(MessageKind::ReadRequest, self.core.node_id, key, "");
        let started = Instant::now();

        if self.caching_enabled.load(Ordering::SeqCst) {
            if let Some(value) = self.cache.get(key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(node = self.core.node_id, key, "cache hit");
                let mut response =
                    Message::response(MessageKind::ReadResponse, self.core.node_id, &request);
                response.value = value;
                response.success = true;
                return Ok(response);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let decision = self.snapshot();
        let mode = if self.adaptive_switching.load(Ordering::SeqCst) {
            self.decide_protocol_for_read(&decision)
        } else {
            decision.read_preference
        };
        let resolved = resolve_for_read(&decision, mode);

        let operation_id = self.operation_counter.fetch_add(1, Ordering::Relaxed);
        self.monitor
            .start_operation(operation_id, MessageKind::ReadRequest, key);

        let result = match resolved {
            ReplicationMode::ChainOnly => {
                self.chain_operations.fetch_add(1, Ordering::Relaxed);
                self.chain.process_read(&request)
            }
            _ => {
                self.quorum_operations.fetch_add(1, Ordering::Relaxed);
                self.quorum.process_read(&request)
            }
        };

        let success = matches!(&result, Ok(response) if response.success);
        self.monitor
            .end_operation(operation_id, success, resolved, self.hops_for(resolved));
        self.note_completion(started, true);

        if success && self.caching_enabled.load(Ordering::SeqCst) {
            if let Ok(response) = &result {
                self.cache.insert(key, &response.value);
            }
        }
        result
    }

    /// Route a write. The cache entry is evicted unconditionally before
    /// dispatch so no reader can observe a stale value after success.
    pub fn write(&self, key: &str, value: &str) -> Result<Message, StoreError> {
        if !self.core.is_running() {
            return Err(StoreError::Shutdown);
        }
        self.cache.invalidate(key);

        let request = Message::request(MessageKind::WriteRequest, self.core.node_id, key, value);
        let started = Instant::now();

        let decision = self.snapshot();
        let mode = if self.adaptive_switching.load(Ordering::SeqCst) {
            self.decide_protocol_for_write(&decision)
        } else {
            decision.write_preference
        };
        let resolved = resolve_for_write(&decision, mode);

        let operation_id = self.operation_counter.fetch_add(1, Ordering::Relaxed);
        self.monitor
            .start_operation(operation_id, MessageKind::WriteRequest, key);

        let result = match resolved {
            ReplicationMode::ChainOnly => {
                self.chain_operations.fetch_add(1, Ordering::Relaxed);
                self.chain.process_write(&request)
            }
            _ => {
                self.quorum_operations.fetch_add(1, Ordering::Relaxed);
                self.quorum.process_write(&request)
            }
        };

        let success = matches!(&result, Ok(response) if response.success);
        self.monitor
            .end_operation(operation_id, success, resolved, self.hops_for(resolved));
        self.note_completion(started, false);
        result
    }

    /// Remove a key through the write path's protocol selection.
    pub fn delete(&self, key: &str) -> Result<Message, StoreError> {
        if !self.core.is_running() {
            return Err(StoreError::Shutdown);
        }
        self.cache.invalidate(key);
        if self.core.store.delete(key) {
            let request =
                Message::request(MessageKind::WriteRequest, self.core.node_id, key, "");
            let mut response =
                Message::response(MessageKind::WriteResponse, self.core.node_id, &request);
            response.success = true;
            Ok(response)
        } else {
            Err(StoreError::KeyNotFound)
        }
    }

    fn hops_for(&self, mode: ReplicationMode) -> u32 {
        match mode {
            ReplicationMode::ChainOnly => self.chain.chain_len().max(1) as u32,
            ReplicationMode::QuorumOnly => 2,
            ReplicationMode::HybridAuto => 1,
        }
    }

    /// Fold a completed operation into the rolling snapshot: EMA latency
    /// and the read/write ratio.
    fn note_completion(&self, started: Instant, is_read: bool) {
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap();
        state.metrics.average_latency_ms = state.metrics.average_latency_ms
            * (1.0 - LATENCY_EMA_WEIGHT)
            + latency_ms * LATENCY_EMA_WEIGHT;
        if is_read {
            state.read_count += 1;
        } else {
            state.write_count += 1;
        }
        if state.write_count > 0 {
            state.metrics.read_write_ratio = state.read_count as f64 / state.write_count as f64;
        }
    }

    // =========================================================================
    // MODE SELECTION
    // =========================================================================

    /// Score both protocols against the current telemetry and pick a mode.
    /// Falls back to `HybridAuto` when neither clears the threshold.
    pub fn select_optimal_mode(&self) -> ReplicationMode {
        let decision = self.snapshot();
        self.score_modes(&decision.metrics, decision.switching_threshold)
    }

    fn score_modes(&self, metrics: &AdaptiveMetrics, threshold: f64) -> ReplicationMode {
        let mut chain_score = 0.0;
        let mut quorum_score = 0.0;

        // Read/write ratio.
        if metrics.read_write_ratio > 3.0 {
            chain_score += 0.3;
        } else if metrics.read_write_ratio < 0.5 {
            quorum_score += 0.3;
        }

        // Partition tolerance.
        if metrics.network_partition_probability > 0.2 {
            chain_score += 0.25;
        } else {
            quorum_score += 0.15;
        }

        // Under high latency, reward the protocol with the better track
        // record.
        if metrics.average_latency_ms > 100.0 {
            let chain_eff = self.monitor.efficiency_score(ReplicationMode::ChainOnly);
            let quorum_eff = self.monitor.efficiency_score(ReplicationMode::QuorumOnly);
            if chain_eff > quorum_eff {
                chain_score += 0.2;
            } else {
                quorum_score += 0.2;
            }
        }

        // Cluster size.
        if metrics.active_nodes < 5 {
            chain_score += 0.15;
        } else {
            quorum_score += 0.1;
        }

        // Workload pattern.
        match metrics.pattern {
            WorkloadPattern::ReadHeavy => chain_score += 0.2,
            WorkloadPattern::WriteHeavy => quorum_score += 0.2,
            WorkloadPattern::Bursty => chain_score += 0.1,
            _ => {}
        }

        if chain_score > quorum_score + threshold {
            ReplicationMode::ChainOnly
        } else if quorum_score > chain_score + threshold {
            ReplicationMode::QuorumOnly
        } else {
            ReplicationMode::HybridAuto
        }
    }

    fn decide_protocol_for_read(&self, decision: &Decision) -> ReplicationMode {
        if decision.partition_pinned
            || decision.metrics.network_partition_probability > 0.2
            || decision.metrics.pattern == WorkloadPattern::ReadHeavy
        {
            return ReplicationMode::ChainOnly;
        }
        decision.read_preference
    }

    fn decide_protocol_for_write(&self, decision: &Decision) -> ReplicationMode {
        if decision.partition_pinned {
            return ReplicationMode::ChainOnly;
        }
        match decision.metrics.pattern {
            WorkloadPattern::WriteHeavy => ReplicationMode::QuorumOnly,
            WorkloadPattern::Bursty => ReplicationMode::ChainOnly,
            _ => decision.write_preference,
        }
    }

    fn should_switch_mode(current: ReplicationMode, target: ReplicationMode) -> bool {
        target != current
    }

    // =========================================================================
    // TELEMETRY
    // =========================================================================

    /// Install a fresh telemetry snapshot, re-derive the workload pattern,
    /// and re-run mode selection. Clears the partition pin once the
    /// reported probability drops below 0.2.
    pub fn update_workload_metrics(&self, metrics: AdaptiveMetrics) {
        let mut state = self.state.lock().unwrap();
        state.metrics = metrics;
        state.metrics.pattern = analyze_workload_pattern(&state.metrics);

        if state.partition_pinned && state.metrics.network_partition_probability < 0.2 {
            state.partition_pinned = false;
            info!(node = self.core.node_id, "partition pin released");
        }

        if self.adaptive_switching.load(Ordering::SeqCst) && !state.partition_pinned {
            let switch_started = Instant::now();
            let target = self.score_modes(&state.metrics, state.switching_threshold);
            if Self::should_switch_mode(state.mode, target) {
                state.mode = target;
                let elapsed_ms = switch_started.elapsed().as_secs_f64() * 1000.0;
                state.switch_times_ms.push(elapsed_ms);
                if state.switch_times_ms.len() > SWITCH_HISTORY {
                    state.switch_times_ms.remove(0);
                }
                info!(node = self.core.node_id, mode = ?target, "replication mode switched");
            }
        }
    }

    /// Pin routing to the chain pipeline until telemetry reports the
    /// partition has cleared.
    pub fn handle_network_partition(&self) {
        let mut state = self.state.lock().unwrap();
        state.mode = ReplicationMode::ChainOnly;
        state.partition_pinned = true;
        warn!(
            node = self.core.node_id,
            "network partition: routing pinned to chain replication"
        );
    }

    pub fn note_node_failed(&self) {
        let mut state = self.state.lock().unwrap();
        state.metrics.active_nodes = state.metrics.active_nodes.saturating_sub(1).max(1);
    }

    pub fn note_node_recovered(&self) {
        let mut state = self.state.lock().unwrap();
        state.metrics.active_nodes += 1;
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn current_mode(&self) -> ReplicationMode {
        self.state.lock().unwrap().mode
    }

    pub fn current_metrics(&self) -> AdaptiveMetrics {
        self.state.lock().unwrap().metrics.clone()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn chain_operations(&self) -> u64 {
        self.chain_operations.load(Ordering::Relaxed)
    }

    pub fn quorum_operations(&self) -> u64 {
        self.quorum_operations.load(Ordering::Relaxed)
    }

    /// Weighted blend of cache effectiveness and protocol balance,
    /// normalized to [0, 1]. Zero division yields 0.
    pub fn hybrid_efficiency(&self) -> f64 {
        let chain_ops = self.chain_operations();
        let quorum_ops = self.quorum_operations();
        let total_ops = chain_ops + quorum_ops;

        let hits = self.cache_hits();
        let misses = self.cache_misses();
        let cache_hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        let protocol_balance = if total_ops == 0 {
            0.0
        } else {
            chain_ops.min(quorum_ops) as f64 / total_ops as f64
        };

        cache_hit_rate * 0.4 + protocol_balance * 0.6
    }

    /// Mean wall-clock cost of a routing decision boundary.
    pub fn mode_switching_overhead(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.switch_times_ms.is_empty() {
            return 0.0;
        }
        state.switch_times_ms.iter().sum::<f64>() / state.switch_times_ms.len() as f64
    }
}

/// Resolve a read's `HybridAuto` into a concrete protocol. The read/write
/// ratio is evaluated fresh on every request; the engine's standing mode
/// is bookkeeping for switch accounting and is never consulted here.
fn resolve_for_read(decision: &Decision, chosen: ReplicationMode) -> ReplicationMode {
    match chosen {
        ReplicationMode::HybridAuto => {
            if decision.metrics.read_write_ratio > 2.0 {
                ReplicationMode::ChainOnly
            } else {
                ReplicationMode::QuorumOnly
            }
        }
        concrete => concrete,
    }
}

/// Resolve a write's `HybridAuto` into a concrete protocol. Partition risk
/// is evaluated fresh on every request; the engine's standing mode is
/// never consulted here.
fn resolve_for_write(decision: &Decision, chosen: ReplicationMode) -> ReplicationMode {
    match chosen {
        ReplicationMode::HybridAuto => {
            if decision.metrics.network_partition_probability > 0.3 {
                ReplicationMode::ChainOnly
            } else {
                ReplicationMode::QuorumOnly
            }
        }
        concrete => concrete,
    }
}

/// Derive the workload pattern from the telemetry snapshot.
pub fn analyze_workload_pattern(metrics: &AdaptiveMetrics) -> WorkloadPattern {
    if metrics.read_write_ratio > 3.0 {
        WorkloadPattern::ReadHeavy
    } else if metrics.read_write_ratio < 0.5 {
        WorkloadPattern::WriteHeavy
    } else if metrics.throughput_ops_per_sec > metrics.average_latency_ms * 10.0 {
        WorkloadPattern::Bursty
    } else {
        WorkloadPattern::Balanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ClusterNet;

    fn single_node_router() -> (Arc<NodeCore>, Arc<HybridRouter>) {
        let mut net = ClusterNet::new(&[1]);
        let endpoint = net.endpoint(1).unwrap();
        let core = Arc::new(NodeCore::new(1, endpoint));
        let chain = Arc::new(ChainReplication::new(core.clone(), vec![1]));
        let quorum = Arc::new(QuorumReplication::new(core.clone(), vec![1]));
        let monitor = Arc::new(PerformanceMonitor::new());
        let router = Arc::new(HybridRouter::new(
            core.clone(),
            chain,
            quorum,
            monitor,
            ReadCache::default(),
            1,
        ));
        (core, router)
    }

    fn metrics(
        ratio: f64,
        latency: f64,
        throughput: f64,
        partition: f64,
        nodes: usize,
        pattern: WorkloadPattern,
    ) -> AdaptiveMetrics {
        AdaptiveMetrics {
            read_write_ratio: ratio,
            average_latency_ms: latency,
            throughput_ops_per_sec: throughput,
            network_partition_probability: partition,
            active_nodes: nodes,
            pattern,
        }
    }

    #[test]
    fn pattern_classification() {
        let m = metrics(5.0, 10.0, 1.0, 0.0, 3, WorkloadPattern::Unknown);
        assert_eq!(analyze_workload_pattern(&m), WorkloadPattern::ReadHeavy);
        let m = metrics(0.3, 10.0, 1.0, 0.0, 3, WorkloadPattern::Unknown);
        assert_eq!(analyze_workload_pattern(&m), WorkloadPattern::WriteHeavy);
        let m = metrics(1.5, 5.0, 100.0, 0.0, 3, WorkloadPattern::Unknown);
        assert_eq!(analyze_workload_pattern(&m), WorkloadPattern::Bursty);
        let m = metrics(1.5, 50.0, 100.0, 0.0, 3, WorkloadPattern::Unknown);
        assert_eq!(analyze_workload_pattern(&m), WorkloadPattern::Balanced);
    }

    #[test]
    fn read_heavy_small_cluster_selects_chain() {
        let (_core, router) = single_node_router();
        router.update_workload_metrics(metrics(
            5.0,
            10.0,
            1.0,
            0.1,
            5,
            WorkloadPattern::ReadHeavy,
        ));
        assert_eq!(router.select_optimal_mode(), ReplicationMode::ChainOnly);
    }

    #[test]
    fn write_heavy_large_cluster_selects_quorum() {
        let (_core, router) = single_node_router();
        router.update_workload_metrics(metrics(
            0.3,
            10.0,
            1.0,
            0.1,
            7,
            WorkloadPattern::WriteHeavy,
        ));
        assert_eq!(router.select_optimal_mode(), ReplicationMode::QuorumOnly);
    }

    #[test]
    fn balanced_scores_fall_back_to_hybrid() {
        let (_core, router) = single_node_router();
        // ratio 1.5 scores nothing; partition 0.1 gives quorum +0.15; four
        // nodes give chain +0.15; Balanced pattern scores nothing. The tie
        // stays inside the default threshold.
        router.update_workload_metrics(metrics(
            1.5,
            50.0,
            10.0,
            0.1,
            4,
            WorkloadPattern::Balanced,
        ));
        assert_eq!(router.select_optimal_mode(), ReplicationMode::HybridAuto);
    }

    #[test]
    fn cache_serves_repeat_reads_without_dispatch() {
        let (_core, router) = single_node_router();
        router.write("k", "a").unwrap();
        assert_eq!(router.read("k").unwrap().value, "a");
        let dispatched_before = router.chain_operations() + router.quorum_operations();

        assert_eq!(router.read("k").unwrap().value, "a");
        assert_eq!(router.cache_hits(), 1);
        // Second read never reached a protocol.
        assert_eq!(
            router.chain_operations() + router.quorum_operations(),
            dispatched_before
        );
    }

    #[test]
    fn write_evicts_cache_before_dispatch() {
        let (_core, router) = single_node_router();
        router.write("k", "a").unwrap();
        assert_eq!(router.read("k").unwrap().value, "a");
        router.write("k", "b").unwrap();
        // The next read misses the cache and observes the new value.
        let hits_before = router.cache_hits();
        assert_eq!(router.read("k").unwrap().value, "b");
        assert_eq!(router.cache_hits(), hits_before);
    }

    #[test]
    fn partition_pins_chain_until_metrics_clear() {
        let (_core, router) = single_node_router();
        router.handle_network_partition();
        assert_eq!(router.current_mode(), ReplicationMode::ChainOnly);

        // Telemetry still reporting a partition leaves the pin in place.
        router.update_workload_metrics(metrics(
            0.3,
            10.0,
            1.0,
            0.5,
            7,
            WorkloadPattern::WriteHeavy,
        ));
        assert_eq!(router.current_mode(), ReplicationMode::ChainOnly);

        // A calm report releases the pin and re-selection runs again.
        router.update_workload_metrics(metrics(
            0.3,
            10.0,
            1.0,
            0.05,
            7,
            WorkloadPattern::WriteHeavy,
        ));
        assert_eq!(router.current_mode(), ReplicationMode::QuorumOnly);
    }

    #[test]
    fn hybrid_preference_consults_live_telemetry_per_request() {
        let (_core, router) = single_node_router();
        router.set_read_preference(ReplicationMode::HybridAuto);
        router.set_write_preference(ReplicationMode::HybridAuto);

        // The engine settles on quorum (ratio 2.5 scores nothing for chain;
        // partition 0.1 and seven nodes favor quorum), but the per-request
        // ratio check still routes the read through chain.
        router.update_workload_metrics(metrics(
            2.5,
            10.0,
            10.0,
            0.1,
            7,
            WorkloadPattern::Balanced,
        ));
        assert_eq!(router.current_mode(), ReplicationMode::QuorumOnly);
        let _ = router.read("k");
        assert_eq!(router.chain_operations(), 1);
        assert_eq!(router.quorum_operations(), 0);

        // The engine settles on chain (partition 0.25 and three nodes), but
        // 0.25 is under the write heuristic's 0.3 bar, so the write still
        // goes through quorum.
        router.update_workload_metrics(metrics(
            1.5,
            10.0,
            10.0,
            0.25,
            3,
            WorkloadPattern::Balanced,
        ));
        assert_eq!(router.current_mode(), ReplicationMode::ChainOnly);
        router.write("k", "v").unwrap();
        assert_eq!(router.chain_operations(), 1);
        assert_eq!(router.quorum_operations(), 1);
    }

    #[test]
    fn mode_switches_record_overhead() {
        let (_core, router) = single_node_router();
        assert_eq!(router.mode_switching_overhead(), 0.0);
        router.update_workload_metrics(metrics(
            5.0,
            10.0,
            1.0,
            0.1,
            4,
            WorkloadPattern::ReadHeavy,
        ));
        assert_ne!(router.current_mode(), ReplicationMode::HybridAuto);
        assert!(router.mode_switching_overhead() >= 0.0);
        let state = router.state.lock().unwrap();
        assert!(!state.switch_times_ms.is_empty());
    }

    #[test]
    fn hybrid_efficiency_handles_zero_division() {
        let (_core, router) = single_node_router();
        assert_eq!(router.hybrid_efficiency(), 0.0);
    }

    #[test]
    fn delete_removes_key_and_cache_entry() {
        let (core, router) = single_node_router();
        router.write("k", "v").unwrap();
        router.read("k").unwrap();
        router.delete("k").unwrap();
        assert!(!core.store.contains("k"));
        assert_eq!(router.delete("k"), Err(StoreError::KeyNotFound));
        assert_eq!(router.read("k"), Err(StoreError::KeyNotFound));
    }
}
