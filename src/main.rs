//! Gridsync node daemon
//!
//! Thin wrapper around gridsync-core for running a grid node.
//!
//! ## Usage
//!
//! ```bash
//! # Join the default grid as a replica
//! gridsync run --dest-folder ./payload
//!
//! # Serve a payload as the file master
//! gridsync run --name master --master ./bundle.tar
//!
//! # Join a peer directly (endpoint id printed by the other node)
//! gridsync run --bootstrap <endpoint-id>
//!
//! # Show the rendezvous key of a namespace
//! gridsync key render-farm
//!
//! # Print the resolved configuration
//! gridsync config --namespace render-farm
//!
//! # Merged log timeline of every local node
//! gridsync logs --level warn --tail 50
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gridsync_core::logging::{init_logging, read_records, LogOptions, RecordFilter};
use gridsync_core::{
    Collaborators, Discovery, GridConfig, GridEvent, GridNode, IrohDiscovery, MemoryNetwork,
    NamespaceKey,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Gridsync - self-organizing peer grid
#[derive(Parser)]
#[command(name = "gridsync")]
#[command(version)]
#[command(about = "Gridsync - payload replication and task triggers across a peer grid")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log directory (default: <data dir>/gridsync/logs)
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// Do not write JSONL log files
    #[arg(long, global = true)]
    no_file_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a grid node until interrupted
    Run {
        #[command(flatten)]
        node: NodeArgs,

        /// Give up if the node is not ready after this many seconds
        #[arg(long, default_value_t = 60)]
        ready_timeout: u64,

        /// Exit as soon as the node is ready
        #[arg(long)]
        once: bool,
    },

    /// Print the rendezvous key for a namespace
    Key {
        /// Namespace
        namespace: String,
    },

    /// Print the resolved configuration as JSON
    Config {
        #[command(flatten)]
        node: NodeArgs,
    },

    /// Print the merged log timeline
    Logs {
        /// Only this node
        #[arg(long)]
        node: Option<String>,

        /// Minimum level (trace, debug, info, warn, error)
        #[arg(long)]
        level: Option<String>,

        /// Only the last N records
        #[arg(long)]
        tail: Option<usize>,
    },
}

/// Node configuration flags; applied over `--config`, under the environment
#[derive(Args, Debug, Default)]
struct NodeArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer display name (default: random)
    #[arg(long)]
    name: Option<String>,

    /// Grid namespace (GRID_NAMESPACE takes precedence)
    #[arg(long)]
    namespace: Option<String>,

    /// Local API port; task ports follow it
    #[arg(long)]
    api_port: Option<u16>,

    /// Serve this payload file as the file master
    #[arg(long, value_name = "FILE")]
    master: Option<PathBuf>,

    /// Folder a received payload is stored in
    #[arg(long)]
    dest_folder: Option<PathBuf>,

    /// Scratch folder for incoming payloads
    #[arg(long)]
    tmp_folder: Option<PathBuf>,

    /// Task entry point folder, relative to the payload folder
    #[arg(long)]
    task_folder: Option<String>,

    /// Task instances per node
    #[arg(long)]
    instances: Option<u32>,

    /// Task group configuration (JSON text)
    #[arg(long)]
    task_conf: Option<String>,

    /// Extra task environment, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Endpoint id of a known peer (repeatable)
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Isolation check period in seconds
    #[arg(long)]
    health_period: Option<u64>,

    /// Delay before offering the payload to a new peer, in milliseconds
    #[arg(long)]
    propagation_delay: Option<u64>,

    /// Skip real task execution and payload writes; use the in-process transport
    #[arg(long)]
    test_mode: bool,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))?;
    if key.is_empty() {
        return Err("empty variable name".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

impl NodeArgs {
    /// Config file, then flags, then environment
    fn resolve(self) -> Result<GridConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => GridConfig::default(),
        };

        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        if let Some(file) = self.master {
            config = config.as_file_master(file);
        }
        if let Some(folder) = self.dest_folder {
            config.files.dest_folder = Some(folder);
        }
        if let Some(folder) = self.tmp_folder {
            config.files.tmp_folder = Some(folder);
        }
        if let Some(folder) = self.task_folder {
            config.tasks.task_folder = folder;
        }
        if let Some(instances) = self.instances {
            config.tasks.instances = instances;
        }
        if let Some(conf) = self.task_conf {
            config.tasks.json_conf = Some(conf);
        }
        config.tasks.env.extend(self.env.into_iter().collect::<BTreeMap<_, _>>());
        config.bootstrap.extend(self.bootstrap);
        if let Some(secs) = self.health_period {
            config.timing.health_check_period = Duration::from_secs(secs);
        }
        if let Some(ms) = self.propagation_delay {
            config.timing.propagation_delay = Duration::from_millis(ms);
        }
        if self.test_mode {
            config.test_mode = true;
        }

        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }
}

fn default_logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gridsync")
        .join("logs")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logs_dir = cli.logs_dir.unwrap_or_else(default_logs_dir);

    match cli.command {
        Commands::Run {
            node,
            ready_timeout,
            once,
        } => {
            let config = node.resolve()?;
            let log_path = init_logging(&LogOptions {
                verbosity: cli.verbose,
                logs_dir: (!cli.no_file_log).then(|| logs_dir.clone()),
                node: config.name.clone(),
                quiet: false,
            })?;
            if let Some(path) = log_path {
                info!(path = %path.display(), "Writing JSONL logs");
            }
            run(config, Duration::from_secs(ready_timeout), once).await?;
        }

        Commands::Key { namespace } => {
            let key = NamespaceKey::derive(&namespace);
            println!("Namespace: {}", namespace);
            println!("  Key: {}", key.to_hex());
            println!("  Short: {}", key);
        }

        Commands::Config { node } => {
            let config = node.resolve()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Logs { node, level, tail } => {
            let records = read_records(
                &logs_dir,
                &RecordFilter {
                    node,
                    min_level: level,
                    tail,
                },
            )?;
            if records.is_empty() {
                println!("No log records in {}", logs_dir.display());
            }
            for record in records {
                let fields = record
                    .fields
                    .as_ref()
                    .map(|f| format!(" {}", f))
                    .unwrap_or_default();
                println!(
                    "{} {:>5} [{}] {}{}",
                    record.ts,
                    record.level.to_uppercase(),
                    record.node,
                    record.msg,
                    fields
                );
            }
        }
    }

    Ok(())
}

async fn run(config: GridConfig, ready_timeout: Duration, once: bool) -> Result<()> {
    let discovery: Arc<dyn Discovery> = if config.test_mode {
        info!("Test mode: using the in-process transport");
        Arc::new(MemoryNetwork::new().discovery())
    } else {
        let iroh = IrohDiscovery::from_config(&config)?;
        println!("Endpoint ID: {}", iroh.endpoint_id());
        Arc::new(iroh)
    };

    let collab = Collaborators::defaults(&config, discovery)?;
    let node = GridNode::new(config.clone(), collab)?;
    let mut events = node.subscribe();
    node.start().await?;

    match tokio::time::timeout(ready_timeout, node.wait_ready()).await {
        Ok(()) => {
            let identity = node.identity();
            println!("Node ready: {} in namespace {}", identity, config.namespace);
        }
        Err(_) => {
            node.shutdown().await;
            anyhow::bail!("node not ready after {:?}", ready_timeout);
        }
    }
    if once {
        node.shutdown().await;
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await;
    Ok(())
}

fn report(event: &GridEvent) {
    match event {
        GridEvent::PeerIdentified { connection, name } => {
            println!("+ peer {} ({})", name, connection)
        }
        GridEvent::PeerDisconnected { connection } => println!("- peer ({})", connection),
        GridEvent::PeerSynchronized { connection, fingerprint } => {
            println!("= peer ({}) synchronized at {}", connection, fingerprint)
        }
        GridEvent::SyncApplied { fingerprint } => println!("payload {} applied", fingerprint),
        GridEvent::SyncFailed { error } => println!("payload sync failed: {}", error),
        GridEvent::DiscoveryRestarted { attempt } => {
            println!("isolated, discovery restarted (attempt {})", attempt)
        }
        _ => {}
    }
}
