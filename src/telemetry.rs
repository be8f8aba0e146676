//! Logging setup: a `tracing` subscriber filtered by the CLI log level,
//! optionally writing to a file instead of stderr.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once, early in main.
pub fn init(level: &str, log_file: Option<&Path>) -> io::Result<()> {
    let directive = match level {
        "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };
    let filter = EnvFilter::new(format!("braid={directive}"));

    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}
