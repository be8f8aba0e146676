//! Built-in workloads: the demo loop and the benchmark core shared by the
//! node binary and `braid-bench`.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use crate::config::{BenchConfig, NodeConfig};
use crate::net::ClusterNet;
use crate::node::Node;
use crate::protocol::message::{NodeId, ReplicationMode};

/// An in-process cluster: every member is a full node wired through the
/// channel transport.
pub struct Cluster {
    pub net: ClusterNet,
    nodes: Vec<Node>,
    ids: Vec<NodeId>,
}

impl Cluster {
    /// Build and start nodes for `ids`, applying `configure` to each
    /// node's config before wiring.
    pub fn launch(ids: &[NodeId], configure: impl Fn(&mut NodeConfig)) -> Cluster {
        let mut net = ClusterNet::new(ids);
        let mut nodes = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut config = NodeConfig::new(id);
            config.peers = ids.iter().copied().filter(|&peer| peer != id).collect();
            configure(&mut config);
            let endpoint = net.endpoint(id).expect("endpoint taken once per node");
            let mut node = Node::new(config, endpoint, ids.to_vec());
            node.start();
            nodes.push(node);
        }
        Cluster {
            net,
            nodes,
            ids: ids.to_vec(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        let index = self
            .ids
            .iter()
            .position(|&candidate| candidate == id)
            .expect("unknown node id");
        &self.nodes[index]
    }

    /// The lowest-id member, which is also the initial chain head.
    pub fn first(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn shutdown(&mut self) {
        for node in &mut self.nodes {
            node.stop();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outcome of the demo workload.
#[derive(Debug, Clone, Copy)]
pub struct DemoReport {
    pub operations: usize,
    pub successful: usize,
    pub elapsed: Duration,
}

impl DemoReport {
    pub fn success_rate(&self) -> f64 {
        if self.operations == 0 {
            return 0.0;
        }
        self.successful as f64 / self.operations as f64
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.operations as f64 / secs
    }
}

/// The built-in demo: a 70/30 read/write mix over a small key space with
/// progress lines every hundred operations.
pub fn run_demo(node: &Node, operations: usize) -> DemoReport {
    println!("Starting demo workload...");
    let mut rng = StdRng::from_entropy();
    let started = Instant::now();
    let mut successful = 0usize;

    for completed in 1..=operations {
        let key = format!("key_{}", rng.gen_range(1..=1000));
        let ok = if rng.gen::<f64>() < 0.7 {
            node.read(&key).map(|response| response.success).unwrap_or(false)
        } else {
            let value = format!("value_{}", rng.gen_range(1..=10_000));
            node.write(&key, &value)
                .map(|response| response.success)
                .unwrap_or(false)
        };
        if ok {
            successful += 1;
        }

        if completed % 100 == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            println!(
                "Progress: {}/{} operations, success rate: {:.1}%, throughput: {:.1} ops/sec",
                completed,
                operations,
                successful as f64 * 100.0 / completed as f64,
                completed as f64 / elapsed.max(f64::EPSILON),
            );
        }
        thread::sleep(Duration::from_millis(10));
    }

    let report = DemoReport {
        operations,
        successful,
        elapsed: started.elapsed(),
    };

    println!("\nDemo completed!");
    println!("Total operations: {}", report.operations);
    println!("Successful operations: {}", report.successful);
    println!("Success rate: {:.1}%", report.success_rate() * 100.0);
    println!("Total time: {}ms", report.elapsed.as_millis());
    println!("Average throughput: {:.1} ops/sec", report.throughput());

    let metrics = node.router.current_metrics();
    println!("Read/Write ratio: {:.2}", metrics.read_write_ratio);
    println!("Average latency: {:.2}ms", metrics.average_latency_ms);
    println!("Hybrid efficiency: {:.3}", node.router.hybrid_efficiency());

    report
}

/// One protocol's benchmark outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolResult {
    pub protocol: String,
    pub total_operations: usize,
    pub duration_sec: f64,
    pub throughput_ops_per_sec: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub hybrid_efficiency: f64,
    pub mode_switching_overhead_ms: f64,
}

/// Full benchmark report, serialized to JSON by the benchmark binary.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub nodes: usize,
    pub threads: usize,
    pub ops_per_thread: usize,
    pub read_ratio: f64,
    pub results: Vec<ProtocolResult>,
}

/// Benchmark one replication mode against a fresh in-process cluster.
/// When `csv` is set, the driver node's per-operation metrics are exported
/// there before teardown.
pub fn benchmark_mode(
    config: &BenchConfig,
    mode: ReplicationMode,
    csv: Option<&Path>,
) -> io::Result<ProtocolResult> {
    let ids: Vec<NodeId> = (1..=config.nodes as NodeId).collect();
    let cluster = Cluster::launch(&ids, |node_config| {
        node_config.mode = mode;
        node_config.detect_failures = false;
        node_config.operation_timeout = Duration::from_secs(2);
    });

    let driver = cluster.first();
    if mode != ReplicationMode::HybridAuto {
        // Pin both paths; hybrid keeps adaptive selection on.
        driver.router.enable_adaptive_switching(false);
    }

    let router = driver.router.clone();
    let completed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut workers = Vec::with_capacity(config.threads);
    for worker_id in 0..config.threads {
        let router = router.clone();
        let completed = completed.clone();
        let ops = config.ops;
        let read_ratio = config.read_ratio;
        let key_range = config.key_range;
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0x5eed ^ worker_id as u64);
            for _ in 0..ops {
                let key = format!("bench_key_{}", rng.gen_range(1..=key_range));
                if rng.gen::<f64>() < read_ratio {
                    let _ = router.read(&key);
                } else {
                    let value = format!("bench_value_{}", rng.gen_range(1..=10_000));
                    let _ = router.write(&key, &value);
                }
                completed.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for worker in workers {
        let _ = worker.join();
    }

    let duration = started.elapsed();
    let stats = driver.monitor.current_stats();
    let result = ProtocolResult {
        protocol: mode.as_str().to_string(),
        total_operations: completed.load(Ordering::Relaxed),
        duration_sec: duration.as_secs_f64(),
        throughput_ops_per_sec: stats.throughput_ops_per_sec,
        average_latency_ms: stats.average_latency_ms,
        p95_latency_ms: stats.p95_latency_ms,
        p99_latency_ms: stats.p99_latency_ms,
        success_rate: stats.success_rate,
        hybrid_efficiency: driver.router.hybrid_efficiency(),
        mode_switching_overhead_ms: driver.router.mode_switching_overhead(),
    };
    if let Some(path) = csv {
        driver.monitor.export_csv(path)?;
    }
    info!(
        protocol = %result.protocol,
        operations = result.total_operations,
        throughput = result.throughput_ops_per_sec,
        "benchmark pass finished"
    );
    Ok(result)
}

/// Run the full per-mode benchmark suite and export per-operation metrics
/// next to the JSON report.
pub fn run_benchmark(config: &BenchConfig) -> io::Result<BenchReport> {
    println!("=== Hybrid Replication Benchmark ===");
    println!(
        "nodes={} threads={} ops/thread={} read_ratio={:.0}%",
        config.nodes,
        config.threads,
        config.ops,
        config.read_ratio * 100.0
    );

    let csv_path = config.output.with_extension("csv");
    let mut results = Vec::new();
    for mode in [
        ReplicationMode::ChainOnly,
        ReplicationMode::QuorumOnly,
        ReplicationMode::HybridAuto,
    ] {
        println!("\nRunning {} benchmark...", mode.as_str());
        // The hybrid pass carries the per-operation CSV export.
        let csv = (mode == ReplicationMode::HybridAuto).then_some(csv_path.as_path());
        let result = benchmark_mode(config, mode, csv)?;
        println!(
            "  {} ops in {:.2}s, {:.1} ops/sec, avg {:.2}ms, p95 {:.2}ms, success {:.1}%",
            result.total_operations,
            result.duration_sec,
            result.throughput_ops_per_sec,
            result.average_latency_ms,
            result.p95_latency_ms,
            result.success_rate * 100.0,
        );
        results.push(result);
    }
    println!("\nPer-operation metrics exported to {}", csv_path.display());

    Ok(BenchReport {
        nodes: config.nodes,
        threads: config.threads,
        ops_per_thread: config.ops,
        read_ratio: config.read_ratio,
        results,
    })
}
