//! MeshCtl - Command line tool for MeshSearch clusters
//!
//! Usage:
//!   meshctl status            - Show node status and peer view
//!   meshctl search <query>    - Run a distributed search
//!   meshctl put <file>        - Index a document from a file
//!   meshctl metrics           - Dump the node's Prometheus metrics

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// MeshSearch Cluster Control Tool
#[derive(Parser)]
#[command(name = "meshctl")]
#[command(about = "Control and monitor MeshSearch clusters", long_about = None)]
struct Cli {
    /// HTTP API endpoint of the node to talk to
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the node and its peer view
    Status,
    /// Run a distributed search
    Search {
        /// Query text
        query: String,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 10)]
        max: usize,
    },
    /// Index a document
    Put {
        /// Path of a file whose contents become the document body
        file: PathBuf,
        /// Explicit document id (assigned by the primary when omitted)
        #[arg(long)]
        doc_id: Option<String>,
    },
    /// Dump Prometheus metrics
    Metrics,
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node_id: String,
    role: String,
    term: u64,
    leader_id: Option<String>,
    cluster_size: usize,
    online_nodes: usize,
    peers: Vec<PeerView>,
}

#[derive(Debug, Deserialize)]
struct PeerView {
    node_id: String,
    status: String,
    #[serde(default)]
    age_ms: Option<u64>,
    #[serde(default)]
    doc_count: u64,
    #[serde(default)]
    load_score: f64,
    #[serde(default)]
    zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
    freshness: String,
    availability_mode: String,
    #[serde(default)]
    unavailable_nodes: Vec<String>,
    #[serde(default)]
    staleness_warning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    doc_id: String,
    score: f32,
    holder_node_id: String,
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct PutDocResponse {
    doc_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Status => show_status(&client, &cli.endpoint).await,
        Commands::Search { query, max } => run_search(&client, &cli.endpoint, &query, max).await,
        Commands::Put { file, doc_id } => run_put(&client, &cli.endpoint, file, doc_id).await,
        Commands::Metrics => dump_metrics(&client, &cli.endpoint).await,
    }
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let status: StatusResponse = client
        .get(format!("{}/status", endpoint))
        .send()
        .await
        .context("node unreachable")?
        .json()
        .await
        .context("malformed status response")?;

    println!("Node:    {} ({})", status.node_id, status.role);
    println!("Term:    {}", status.term);
    println!(
        "Leader:  {}",
        status.leader_id.as_deref().unwrap_or("(unknown)")
    );
    println!(
        "Cluster: {}/{} nodes online",
        status.online_nodes, status.cluster_size
    );
    println!();
    println!(
        "{:<12} {:<10} {:>9} {:>7} {:>6}  {}",
        "NODE", "STATUS", "AGE(ms)", "DOCS", "LOAD", "ZONE"
    );
    for peer in status.peers {
        println!(
            "{:<12} {:<10} {:>9} {:>7} {:>6.2}  {}",
            peer.node_id,
            peer.status,
            peer.age_ms.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            peer.doc_count,
            peer.load_score,
            peer.zone.unwrap_or_default(),
        );
    }
    Ok(())
}

async fn run_search(
    client: &reqwest::Client,
    endpoint: &str,
    query: &str,
    max: usize,
) -> anyhow::Result<()> {
    let response: SearchResponse = client
        .get(format!("{}/search", endpoint))
        .query(&[("q", query), ("max", &max.to_string())])
        .send()
        .await
        .context("node unreachable")?
        .json()
        .await
        .context("malformed search response")?;

    println!(
        "{} result(s), freshness {}, mode {}",
        response.results.len(),
        response.freshness,
        response.availability_mode
    );
    if !response.unavailable_nodes.is_empty() {
        println!("unavailable nodes: {}", response.unavailable_nodes.join(", "));
    }
    if let Some(warning) = response.staleness_warning {
        println!("warning: {}", warning);
    }
    println!();
    for result in response.results {
        println!(
            "{:<22} {:>7.3}  [{}]",
            result.doc_id, result.score, result.holder_node_id
        );
        println!("    {}", result.snippet.replace('\n', " "));
    }
    Ok(())
}

async fn run_put(
    client: &reqwest::Client,
    endpoint: &str,
    file: PathBuf,
    doc_id: Option<String>,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;

    let mut body = serde_json::json!({ "content": content });
    if let Some(doc_id) = doc_id {
        body["doc_id"] = serde_json::Value::String(doc_id);
    }

    let response = client
        .post(format!("{}/doc", endpoint))
        .json(&body)
        .send()
        .await
        .context("node unreachable")?;

    if response.status().is_success() {
        let put: PutDocResponse = response.json().await.context("malformed response")?;
        println!("indexed as {}", put.doc_id);
        return Ok(());
    }

    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(err) => bail!("write failed ({}): {} [{}]", status, err.error, err.code),
        Err(_) => bail!("write failed with status {}", status),
    }
}

async fn dump_metrics(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let text = client
        .get(format!("{}/metrics", endpoint))
        .send()
        .await
        .context("node unreachable")?
        .text()
        .await?;
    print!("{}", text);
    Ok(())
}
