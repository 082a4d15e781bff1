//! MeshSearch Configuration
//!
//! Configuration structures for a MeshSearch cluster node, loaded from
//! a TOML file and validated at boot.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main MeshSearch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Network bind addresses
    pub network: NetworkConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Protocol timing knobs
    #[serde(default)]
    pub timing: TimingConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier; node ids are totally ordered lexicographically
    /// and the ordering decides election tie-breaks
    pub id: String,

    /// Optional failure-domain label used to spread replicas
    #[serde(default)]
    pub zone: Option<String>,

    /// Data directory for the document store and placement snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Network bind addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP bind address for heartbeat and election datagrams
    #[serde(default = "default_heartbeat_address")]
    pub bind_heartbeat: String,

    /// TCP bind address for peer RPCs
    #[serde(default = "default_rpc_address")]
    pub bind_rpc: String,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub rpc_addr: String,
    pub heartbeat_addr: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Statically configured peers (excluding self)
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Accept heartbeats from peers that are not in the static list
    #[serde(default)]
    pub allow_dynamic_peers: bool,

    /// Expected cluster size for partition detection; 0 means peers + 1
    #[serde(default)]
    pub expected_size: usize,
}

/// Protocol timing knobs, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Heartbeat emit interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A peer is OFFLINE after this long without a heartbeat
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,

    /// How long a candidate waits for ELECTION_OK before claiming the round
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// How long a deferring node waits for COORDINATOR before retrying
    #[serde(default = "default_coordinator_wait_ms")]
    pub coordinator_wait_ms: u64,

    /// Grace period after boot before the first election; 0 means 2x heartbeat
    #[serde(default)]
    pub bootstrap_grace_ms: u64,

    /// Per-candidate deadline on fan-out queries
    #[serde(default = "default_query_deadline_ms")]
    pub query_deadline_ms: u64,

    /// Per-replica deadline on replication calls
    #[serde(default = "default_replication_deadline_ms")]
    pub replication_deadline_ms: u64,

    /// Placement snapshot interval on the leader
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Total holders per document (primary + replicas)
    #[serde(default = "default_replication_factor")]
    pub factor: usize,

    /// Concurrent background repair transfers on the leader
    #[serde(default = "default_repair_concurrency")]
    pub repair_concurrency: usize,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_http: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshsearch")
}

fn default_heartbeat_address() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_rpc_address() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_peer_timeout_ms() -> u64 {
    15000
}

fn default_election_timeout_ms() -> u64 {
    2000
}

fn default_coordinator_wait_ms() -> u64 {
    3000
}

fn default_query_deadline_ms() -> u64 {
    3000
}

fn default_replication_deadline_ms() -> u64 {
    5000
}

fn default_snapshot_interval_ms() -> u64 {
    60_000
}

fn default_replication_factor() -> usize {
    2
}

fn default_repair_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            coordinator_wait_ms: default_coordinator_wait_ms(),
            bootstrap_grace_ms: 0,
            query_deadline_ms: default_query_deadline_ms(),
            replication_deadline_ms: default_replication_deadline_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: default_replication_factor(),
            repair_concurrency: default_repair_concurrency(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_http: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; the node refuses to start on failure
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.network.bind_heartbeat.is_empty() || self.network.bind_rpc.is_empty() {
            return Err(crate::Error::Config(
                "network.bind_heartbeat and network.bind_rpc cannot be empty".into(),
            ));
        }

        if self.replication.factor < 1 {
            return Err(crate::Error::Config(
                "replication.factor must be at least 1".into(),
            ));
        }

        if self.timing.peer_timeout_ms <= self.timing.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "timing.peer_timeout_ms must exceed timing.heartbeat_interval_ms".into(),
            ));
        }

        for peer in &self.cluster.peers {
            if peer.id.is_empty() || peer.rpc_addr.is_empty() || peer.heartbeat_addr.is_empty() {
                return Err(crate::Error::Config(format!(
                    "incomplete peer entry: {:?}",
                    peer.id
                )));
            }
            if peer.id == self.node.id {
                return Err(crate::Error::Config(format!(
                    "peer list must not contain this node ({})",
                    self.node.id
                )));
            }
        }

        Ok(())
    }

    /// Total cluster size used for partition detection
    pub fn cluster_size(&self) -> usize {
        if self.cluster.expected_size > 0 {
            self.cluster.expected_size
        } else {
            self.cluster.peers.len() + 1
        }
    }

    /// Write quorum for the configured replication factor
    pub fn quorum_target(&self) -> usize {
        self.replication.factor / 2 + 1
    }

    /// Directory for placement snapshots
    pub fn snapshot_dir(&self) -> PathBuf {
        self.node.data_dir.join("snapshots")
    }

    /// Path of the local document store
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("documents.db")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.timing.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.peer_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.election_timeout_ms)
    }

    pub fn coordinator_wait(&self) -> Duration {
        Duration::from_millis(self.timing.coordinator_wait_ms)
    }

    /// Grace period before the first election; defaults to 2x heartbeat interval
    pub fn bootstrap_grace(&self) -> Duration {
        if self.timing.bootstrap_grace_ms > 0 {
            Duration::from_millis(self.timing.bootstrap_grace_ms)
        } else {
            Duration::from_millis(self.timing.heartbeat_interval_ms * 2)
        }
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.timing.query_deadline_ms)
    }

    pub fn replication_deadline(&self) -> Duration {
        Duration::from_millis(self.timing.replication_deadline_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.timing.snapshot_interval_ms)
    }
}
