//! Structured logging: console output plus one JSONL file per node per day.
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-17_calm-harbor-42.jsonl
//!     └── 2026-10-17_brisk-falcon-07.jsonl
//! ```
//!
//! Query with jq:
//!
//! ```bash
//! jq 'select(.fields.fingerprint != null)' logs/raw/*.jsonl
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts)'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

use std::path::PathBuf;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{GridError, GridResult};

pub use entry::LogRecord;
pub use layer::JsonlLayer;
pub use writer::{read_records, NodeLogWriter, RecordFilter};

/// How the process should log
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// `-v` count: 0 info, 1 debug, 2+ trace
    pub verbosity: u8,
    /// Where JSONL files go; `None` disables file logging
    pub logs_dir: Option<PathBuf>,
    /// Node name used in file names and records
    pub node: String,
    /// Disable the console layer
    pub quiet: bool,
}

/// Default filter directive for a `-v` count
pub fn filter_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info,iroh=warn,iroh_gossip=warn",
        1 => "debug,iroh=info,iroh_gossip=info",
        _ => "trace",
    }
}

/// Install the global subscriber; `RUST_LOG` overrides the verbosity
///
/// Returns the JSONL file path when file logging is on.
pub fn init_logging(options: &LogOptions) -> GridResult<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for(options.verbosity)));

    let jsonl = match &options.logs_dir {
        Some(dir) => Some(JsonlLayer::new(dir, &options.node)?),
        None => None,
    };
    let path = jsonl.as_ref().map(JsonlLayer::log_path);

    let console = (!options.quiet).then(|| tracing_subscriber::fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(jsonl)
        .with(console)
        .try_init()
        .map_err(|e| GridError::Config(format!("logging already initialised: {}", e)))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert!(filter_for(0).starts_with("info"));
        assert!(filter_for(1).starts_with("debug"));
        assert_eq!(filter_for(5), "trace");
    }
}
