//! Operation-level performance monitoring.
//!
//! The monitor is a collaborator handed to the router and protocols at
//! construction (never a process-wide singleton), so tests can substitute a
//! fresh instance. It tracks per-operation latency and outcome, keeps a
//! bounded ring of completed operations for percentile computation, and
//! exports the ring as CSV.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::protocol::message::{now_micros, MessageKind, ReplicationMode};

/// Completed operations retained for percentile computation.
const RING_CAPACITY: usize = 10_000;

/// Completed operations older than this are swept.
pub const RETENTION: Duration = Duration::from_secs(3600);

/// One tracked operation.
#[derive(Debug, Clone)]
struct OperationRecord {
    started_ts_us: u64,
    started_at: Instant,
    latency_ms: u64,
    kind: MessageKind,
    key: String,
    success: bool,
    hops: u32,
    mode: ReplicationMode,
}

/// Aggregate snapshot of the monitor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfStats {
    pub throughput_ops_per_sec: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
}

#[derive(Default)]
struct MonitorState {
    active: HashMap<u64, OperationRecord>,
    completed: Vec<OperationRecord>,
    cumulative_latency_ms: f64,
    mode_latency_ms: [f64; 3],
    mode_ops: [u64; 3],
}

/// Latency/throughput/outcome collector for replication operations.
pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    started_at: Mutex<Instant>,
}

impl PerformanceMonitor {
    pub fn new() -> PerformanceMonitor {
        PerformanceMonitor {
            state: Mutex::new(MonitorState::default()),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Mutex::new(Instant::now()),
        }
    }

    /// Begin tracking an operation.
    pub fn start_operation(&self, operation_id: u64, kind: MessageKind, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.active.insert(
            operation_id,
            OperationRecord {
                started_ts_us: now_micros(),
                started_at: Instant::now(),
                latency_ms: 0,
                kind,
                key: key.to_string(),
                success: false,
                hops: 0,
                mode: ReplicationMode::HybridAuto,
            },
        );
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Finish tracking an operation, folding it into the ring and the
    /// per-mode buckets. Unknown ids are ignored.
    pub fn end_operation(
        &self,
        operation_id: u64,
        success: bool,
        mode: ReplicationMode,
        hops: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let Some(mut record) = state.active.remove(&operation_id) else {
            return;
        };

        record.latency_ms = record.started_at.elapsed().as_millis() as u64;
        record.success = success;
        record.mode = mode;
        record.hops = hops;

        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let bucket = mode.ordinal() as usize;
        state.mode_ops[bucket] += 1;
        state.mode_latency_ms[bucket] += record.latency_ms as f64;
        state.cumulative_latency_ms += record.latency_ms as f64;

        state.completed.push(record);
        if state.completed.len() > RING_CAPACITY {
            state.completed.remove(0);
        }
    }

    pub fn total_operations(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn successful_operations(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed_operations(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Operations per second since construction (or last reset).
    pub fn throughput(&self) -> f64 {
        let elapsed = self.started_at.lock().unwrap().elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_operations() as f64 / elapsed
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_operations();
        if total == 0 {
            return 0.0;
        }
        self.successful_operations() as f64 / total as f64
    }

    /// Mean latency over successful completions.
    pub fn average_latency_ms(&self) -> f64 {
        let successful = self.successful_operations();
        if successful == 0 {
            return 0.0;
        }
        self.state.lock().unwrap().cumulative_latency_ms / successful as f64
    }

    /// Latency percentile over the completed ring, interpolated linearly
    /// between bracketing samples. `percentile` is in [0, 1].
    pub fn percentile_latency_ms(&self, percentile: f64) -> f64 {
        let state = self.state.lock().unwrap();
        let mut samples: Vec<u64> = state
            .completed
            .iter()
            .filter(|record| record.success)
            .map(|record| record.latency_ms)
            .collect();
        drop(state);

        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_unstable();

        let index = percentile.clamp(0.0, 1.0) * (samples.len() - 1) as f64;
        let lower = index.floor() as usize;
        let upper = index.ceil() as usize;
        if lower == upper {
            return samples[lower] as f64;
        }
        let weight = index - lower as f64;
        samples[lower] as f64 * (1.0 - weight) + samples[upper] as f64 * weight
    }

    pub fn current_stats(&self) -> PerfStats {
        PerfStats {
            throughput_ops_per_sec: self.throughput(),
            average_latency_ms: self.average_latency_ms(),
            p95_latency_ms: self.percentile_latency_ms(0.95),
            p99_latency_ms: self.percentile_latency_ms(0.99),
            success_rate: self.success_rate(),
        }
    }

    /// Stats restricted to operations started within the trailing window.
    pub fn historical_stats(&self, window: Duration) -> PerfStats {
        let state = self.state.lock().unwrap();
        let mut in_window = 0u64;
        let mut successes = 0u64;
        let mut total_latency = 0.0;
        let mut samples = Vec::new();

        for record in &state.completed {
            if record.started_at.elapsed() <= window {
                in_window += 1;
                if record.success {
                    successes += 1;
                    total_latency += record.latency_ms as f64;
                    samples.push(record.latency_ms);
                }
            }
        }
        drop(state);

        let mut stats = PerfStats::default();
        if in_window == 0 {
            return stats;
        }
        stats.throughput_ops_per_sec = in_window as f64 / window.as_secs_f64().max(f64::EPSILON);
        stats.success_rate = successes as f64 / in_window as f64;
        if successes > 0 {
            stats.average_latency_ms = total_latency / successes as f64;
            samples.sort_unstable();
            stats.p95_latency_ms = interpolate(&samples, 0.95);
            stats.p99_latency_ms = interpolate(&samples, 0.99);
        }
        stats
    }

    /// Mode efficiency score in [0, 1]: 0.6 weight on normalized throughput,
    /// 0.4 on inverse latency. Used by the router's latency factor.
    pub fn efficiency_score(&self, mode: ReplicationMode) -> f64 {
        let state = self.state.lock().unwrap();
        let bucket = mode.ordinal() as usize;
        let ops = state.mode_ops[bucket];
        if ops == 0 {
            return 0.0;
        }
        let avg_latency = state.mode_latency_ms[bucket] / ops as f64;
        drop(state);

        let throughput_score = (self.throughput() / 1000.0).min(1.0);
        let latency_score = (1.0 - avg_latency / 1000.0).max(0.0);
        throughput_score * 0.6 + latency_score * 0.4
    }

    pub fn mode_operations(&self, mode: ReplicationMode) -> u64 {
        self.state.lock().unwrap().mode_ops[mode.ordinal() as usize]
    }

    /// Drop completed records older than the retention window.
    pub fn sweep_old_operations(&self) {
        let mut state = self.state.lock().unwrap();
        state
            .completed
            .retain(|record| record.started_at.elapsed() < RETENTION);
    }

    /// Export the completed ring as CSV. One row per operation; kind and
    /// mode are wire ordinals.
    pub fn export_csv(&self, path: &Path) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "timestamp,operation_type,success,latency_ms,mode,hops,key")?;
        for record in &state.completed {
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                record.started_ts_us,
                record.kind.ordinal(),
                if record.success { 1 } else { 0 },
                record.latency_ms,
                record.mode.ordinal(),
                record.hops,
                record.key,
            )?;
        }
        out.flush()?;
        info!(path = %path.display(), rows = state.completed.len(), "metrics exported");
        Ok(())
    }

    /// Clear everything and restart the throughput clock.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = MonitorState::default();
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        *self.started_at.lock().unwrap() = Instant::now();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        PerformanceMonitor::new()
    }
}

fn interpolate(sorted: &[u64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = percentile.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let weight = index - lower as f64;
    sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_success_rate() {
        let monitor = PerformanceMonitor::new();
        monitor.start_operation(1, MessageKind::ReadRequest, "a");
        monitor.end_operation(1, true, ReplicationMode::ChainOnly, 1);
        monitor.start_operation(2, MessageKind::WriteRequest, "b");
        monitor.end_operation(2, false, ReplicationMode::QuorumOnly, 1);

        assert_eq!(monitor.total_operations(), 2);
        assert_eq!(monitor.successful_operations(), 1);
        assert_eq!(monitor.failed_operations(), 1);
        assert!((monitor.success_rate() - 0.5).abs() < 1e-9);
        assert_eq!(monitor.mode_operations(ReplicationMode::ChainOnly), 1);
        assert_eq!(monitor.mode_operations(ReplicationMode::QuorumOnly), 1);
    }

    #[test]
    fn unknown_operation_id_is_ignored() {
        let monitor = PerformanceMonitor::new();
        monitor.end_operation(99, true, ReplicationMode::ChainOnly, 1);
        assert_eq!(monitor.total_operations(), 0);
    }

    #[test]
    fn percentile_interpolates_between_samples() {
        assert_eq!(interpolate(&[10], 0.95), 10.0);
        assert_eq!(interpolate(&[0, 100], 0.5), 50.0);
        // index = 0.95 * 3 = 2.85 -> between 30 and 40.
        let value = interpolate(&[10, 20, 30, 40], 0.95);
        assert!((value - 38.5).abs() < 1e-9);
    }

    #[test]
    fn csv_export_has_expected_shape() {
        let monitor = PerformanceMonitor::new();
        monitor.start_operation(1, MessageKind::ReadRequest, "user:1");
        monitor.end_operation(1, true, ReplicationMode::ChainOnly, 3);

        let path = std::env::temp_dir().join("braid_metrics_test.csv");
        monitor.export_csv(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,operation_type,success,latency_ms,mode,hops,key"
        );
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row.len(), 7);
        assert_eq!(row[1], "0"); // ReadRequest ordinal
        assert_eq!(row[2], "1");
        assert_eq!(row[4], "0"); // ChainOnly ordinal
        assert_eq!(row[5], "3");
        assert_eq!(row[6], "user:1");
    }

    #[test]
    fn reset_clears_state() {
        let monitor = PerformanceMonitor::new();
        monitor.start_operation(1, MessageKind::ReadRequest, "a");
        monitor.end_operation(1, true, ReplicationMode::ChainOnly, 1);
        monitor.reset();
        assert_eq!(monitor.total_operations(), 0);
        assert_eq!(monitor.average_latency_ms(), 0.0);
        assert_eq!(monitor.percentile_latency_ms(0.95), 0.0);
    }
}
