//! MeshSearch - Distributed Document Search Cluster
//!
//! Node daemon entry point: config handling and the run loop.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshsearch::cluster::Node;
use meshsearch::config::MeshConfig;
use meshsearch::error::Result;

/// MeshSearch - Distributed Document Search Cluster
#[derive(Parser)]
#[command(name = "meshsearch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "meshsearch.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MeshSearch node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "meshsearch.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the node and run until interrupted
async fn run_start(config_path: PathBuf) -> Result<()> {
    println!(
        r#"
  __  __        _    ___                  _
 |  \/  |___ __| |_ / __| ___ __ _ _ _ __| |_
 | |\/| / -_|_-< ' \\__ \/ -_) _` | '_/ _| ' \
 |_|  |_\___/__/_||_|___/\___\__,_|_| \__|_||_|
"#
    );

    tracing::info!("starting meshsearch node...");

    let config = match MeshConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("loaded configuration for node {}", config.node.id);

    meshsearch::metrics::install();

    let node = Node::start(config).await?;

    // Ctrl+C flips the shutdown token
    let stopper = std::sync::Arc::clone(&node);
    let (ctrlc_tx, mut ctrlc_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send(());
    })
    .map_err(|e| meshsearch::Error::Internal(format!("ctrl-c handler: {}", e)))?;

    tokio::select! {
        _ = ctrlc_rx.recv() => {
            tracing::info!("interrupt received");
        }
        _ = node.wait() => {}
    }

    stopper.stop().await;
    tracing::info!("bye");
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let template = format!(
        r#"[node]
id = "{node_id}"
# zone = "rack-a"
data_dir = "/var/lib/meshsearch"

[network]
bind_heartbeat = "0.0.0.0:5000"
bind_rpc = "0.0.0.0:5001"

[api]
bind_http = "0.0.0.0:8080"

[cluster]
# peers = [
#     {{ id = "node-2", rpc_addr = "10.0.0.2:5001", heartbeat_addr = "10.0.0.2:5000" }},
# ]
allow_dynamic_peers = false

[replication]
factor = 2

[timing]
heartbeat_interval_ms = 5000
peer_timeout_ms = 15000

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, template)?;
    println!("wrote starter configuration to {}", output.display());
    Ok(())
}

/// Check the configuration file for errors
fn run_validate(config_path: PathBuf) -> Result<()> {
    match MeshConfig::from_file(&config_path) {
        Ok(config) => {
            println!("configuration OK");
            println!("  node id:       {}", config.node.id);
            println!("  cluster size:  {}", config.cluster_size());
            println!("  replication K: {}", config.replication.factor);
            println!("  write quorum:  {}", config.quorum_target());
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration invalid: {}", e);
            Err(e)
        }
    }
}
