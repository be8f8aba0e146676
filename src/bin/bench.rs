//! Benchmark binary: runs the per-mode suite (chain, quorum, hybrid)
//! against fresh in-process clusters and writes a JSON report.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use braid::config::BenchConfig;
use braid::workload;

#[derive(Parser, Debug)]
#[command(
    name = "braid-bench",
    version,
    about = "Benchmark the hybrid replication engine"
)]
struct Cli {
    /// Cluster size.
    #[arg(long, value_name = "N", default_value_t = 5)]
    nodes: usize,

    /// Worker threads.
    #[arg(long, value_name = "N", default_value_t = 4)]
    threads: usize,

    /// Operations per thread.
    #[arg(long, value_name = "N", default_value_t = 1000)]
    ops: usize,

    /// Fraction of reads, in [0, 1].
    #[arg(long, value_name = "R", default_value_t = 0.7)]
    read_ratio: f64,

    /// Report output path.
    #[arg(long, value_name = "PATH", default_value = "benchmark_results.json")]
    output: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.nodes == 0 || cli.threads == 0 || cli.ops == 0 {
        eprintln!("error: --nodes, --threads and --ops must be positive");
        return ExitCode::FAILURE;
    }
    if !(0.0..=1.0).contains(&cli.read_ratio) {
        eprintln!("error: --read-ratio must be within [0, 1]");
        return ExitCode::FAILURE;
    }
    if let Err(err) = braid::telemetry::init("warn", None) {
        eprintln!("error: failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let config = BenchConfig {
        nodes: cli.nodes,
        threads: cli.threads,
        ops: cli.ops,
        read_ratio: cli.read_ratio,
        output: cli.output.clone(),
        ..BenchConfig::default()
    };

    let report = match workload::run_benchmark(&config) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: benchmark failed: {err}");
            return ExitCode::FAILURE;
        }
    };

    let json = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(err) => {
            eprintln!("error: failed to serialize report: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = std::fs::write(&cli.output, json) {
        eprintln!("error: failed to write {}: {err}", cli.output.display());
        return ExitCode::FAILURE;
    }

    println!("\nReport written to {}", cli.output.display());
    ExitCode::SUCCESS
}
