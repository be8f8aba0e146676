//! Node binary: starts a replicated KV node (with its peers simulated
//! in-process over the channel transport), then runs the demo workload,
//! the benchmark, or an interactive command loop.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use braid::config::BenchConfig;
use braid::protocol::message::{NodeId, ReplicationMode};
use braid::workload::{self, Cluster};

#[derive(Parser, Debug)]
#[command(
    name = "braid",
    version,
    about = "Replicated KV store with hybrid chain/quorum replication"
)]
struct Cli {
    /// Node identifier (nonzero).
    #[arg(long, value_name = "N")]
    node_id: NodeId,

    /// Listen port.
    #[arg(long, value_name = "P", default_value_t = 8080)]
    port: u16,

    /// Comma-separated peer node ids.
    #[arg(long, value_delimiter = ',', value_name = "id,id,...")]
    peers: Vec<NodeId>,

    /// Replication mode: chain, quorum or hybrid.
    #[arg(long, default_value = "hybrid")]
    mode: String,

    /// Log level: debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (stderr when omitted).
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Run the built-in demo workload and exit.
    #[arg(long, conflicts_with = "benchmark")]
    demo: bool,

    /// Run the performance benchmark and exit.
    #[arg(long)]
    benchmark: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.node_id == 0 {
        eprintln!("error: --node-id must be nonzero");
        return ExitCode::FAILURE;
    }
    let Some(mode) = ReplicationMode::parse(&cli.mode) else {
        eprintln!(
            "error: unknown mode {:?} (expected chain, quorum or hybrid)",
            cli.mode
        );
        return ExitCode::FAILURE;
    };
    if let Err(err) = braid::telemetry::init(&cli.log_level, cli.log_file.as_deref()) {
        eprintln!("error: failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    info!(node = cli.node_id, port = cli.port, mode = mode.as_str(), "starting node");

    let mut ids = cli.peers.clone();
    ids.push(cli.node_id);
    ids.sort_unstable();
    ids.dedup();

    // The transport is in-process: peers run as full nodes inside this
    // process, wired through channels.
    let mut cluster = Cluster::launch(&ids, |config| {
        config.port = cli.port;
        config.mode = mode;
    });

    let result = if cli.demo {
        workload::run_demo(cluster.node(cli.node_id), 1000);
        Ok(())
    } else if cli.benchmark {
        run_benchmark(ids.len())
    } else {
        interactive_loop(&cluster, cli.node_id, ids.len())
    };

    cluster.shutdown();
    match result {
        Ok(()) => {
            info!(node = cli.node_id, "node shut down");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run_benchmark(nodes: usize) -> io::Result<()> {
    let config = BenchConfig {
        nodes,
        threads: 4,
        ops: 250,
        ..BenchConfig::default()
    };
    let report = workload::run_benchmark(&config)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_default()
    );
    Ok(())
}

fn interactive_loop(cluster: &Cluster, node_id: NodeId, nodes: usize) -> io::Result<()> {
    let node = cluster.node(node_id);
    println!("Node {node_id} is running. Type 'help' for commands.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("help") => {
                println!("Commands:");
                println!("  get KEY          - read a key");
                println!("  put KEY VALUE    - write a key");
                println!("  del KEY          - delete a key");
                println!("  status           - show system status");
                println!("  metrics          - export performance metrics");
                println!("  reset            - reset performance counters");
                println!("  demo             - run demo workload");
                println!("  benchmark        - run performance benchmark");
                println!("  quit             - exit");
            }
            Some("get") => match parts.next() {
                Some(key) => match node.read(key) {
                    Ok(response) => println!("{}", response.value),
                    Err(err) => println!("error: {err}"),
                },
                None => println!("usage: get KEY"),
            },
            Some("put") => match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => match node.write(key, value) {
                    Ok(_) => println!("ok"),
                    Err(err) => println!("error: {err}"),
                },
                _ => println!("usage: put KEY VALUE"),
            },
            Some("del") => match parts.next() {
                Some(key) => match node.delete(key) {
                    Ok(_) => println!("ok"),
                    Err(err) => println!("error: {err}"),
                },
                None => println!("usage: del KEY"),
            },
            Some("status") => print_status(node),
            Some("metrics") => {
                let path = PathBuf::from("metrics_export.csv");
                node.monitor.export_csv(&path)?;
                println!("Metrics exported to {}", path.display());
            }
            Some("reset") => {
                node.monitor.reset();
                println!("Performance metrics reset");
            }
            Some("demo") => {
                workload::run_demo(node, 1000);
            }
            Some("benchmark") => {
                run_benchmark(nodes)?;
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("Unknown command: {other}. Type 'help' for commands."),
            None => {}
        }
    }
    Ok(())
}

fn print_status(node: &braid::Node) {
    let stats = node.monitor.current_stats();
    let metrics = node.router.current_metrics();
    println!("=== System Status ===");
    println!("Mode: {}", node.router.current_mode().as_str());
    println!("Throughput: {:.1} ops/sec", stats.throughput_ops_per_sec);
    println!("Average latency: {:.2}ms", stats.average_latency_ms);
    println!("Success rate: {:.1}%", stats.success_rate * 100.0);
    println!("Hybrid efficiency: {:.3}", node.router.hybrid_efficiency());
    println!("Active nodes: {}", metrics.active_nodes);
    println!("Chain length: {}", node.chain.chain_len());
    println!("Quorum size: {}", node.quorum.quorum_size());
    println!("Store entries: {}", node.core().store.len());
}
