//! MeshSearch Error Types

use thiserror::Error;

/// Result type alias for MeshSearch operations
pub type Result<T> = std::result::Result<T, Error>;

/// MeshSearch error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // Coordination errors
    #[error("Not leader: current leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("No leader available")]
    NoLeader,

    #[error("Leader changed during operation (term {term})")]
    LeaderChanged { term: u64 },

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    // Replication errors
    #[error("Write quorum failed: {acks}/{required} acks")]
    QuorumFailed { acks: usize, required: usize },

    #[error("Conflicting document {doc_id}: fingerprint mismatch")]
    Conflict { doc_id: String },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Placement degraded: no live holder for {0}")]
    Degraded(String),

    #[error("Write already in flight for {0}")]
    WriteInFlight(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Peer {0} is busy")]
    PeerBusy(String),

    #[error("Wire format error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Peer returned {kind}: {message}")]
    Remote { kind: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Stable error token exposed on the HTTP surface and in RPC error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_INVALID",
            Error::NotLeader { .. } | Error::NoLeader | Error::LeaderChanged { .. } => {
                "LEADER_CHANGED"
            }
            Error::QuorumFailed { .. } => "WRITE_QUORUM_FAILED",
            Error::Conflict { .. } | Error::WriteInFlight(_) => "CONFLICT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Degraded(_) => "DEGRADED",
            Error::PeerBusy(_) => "PEER_BUSY",
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::Timeout(_)
            | Error::UnknownPeer(_) => "TRANSIENT_PEER",
            Error::Remote { kind, .. } => match kind.as_str() {
                "CONFLICT" => "CONFLICT",
                "LEADER_CHANGED" => "LEADER_CHANGED",
                "NOT_FOUND" => "NOT_FOUND",
                "WRITE_QUORUM_FAILED" => "WRITE_QUORUM_FAILED",
                _ => "TRANSIENT_PEER",
            },
            _ => "INTERNAL",
        }
    }

    /// Check if this error is worth retrying against the same peer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::PeerBusy(_)
        )
    }

    /// Check if this error indicates the node should give up coordinator duties
    pub fn should_step_down(&self) -> bool {
        matches!(self, Error::Internal(_) | Error::Snapshot(_))
    }

    /// Rebuild a typed error from a remote error reply
    pub fn from_remote(kind: &str, message: &str) -> Self {
        Error::Remote {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens_are_stable() {
        assert_eq!(Error::NoLeader.kind(), "LEADER_CHANGED");
        assert_eq!(
            Error::QuorumFailed { acks: 1, required: 2 }.kind(),
            "WRITE_QUORUM_FAILED"
        );
        assert_eq!(Error::Conflict { doc_id: "d1".into() }.kind(), "CONFLICT");
        assert_eq!(Error::Timeout("10.0.0.1:5001".into()).kind(), "TRANSIENT_PEER");
        assert_eq!(Error::Config("bad".into()).kind(), "CONFIG_INVALID");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(Error::PeerBusy("n2".into()).is_retryable());
        assert!(!Error::Conflict { doc_id: "d".into() }.is_retryable());
        assert!(!Error::QuorumFailed { acks: 0, required: 2 }.is_retryable());
    }

    #[test]
    fn test_remote_kind_mapping() {
        let err = Error::from_remote("CONFLICT", "fingerprint mismatch");
        assert_eq!(err.kind(), "CONFLICT");
        let err = Error::from_remote("SOMETHING_NEW", "unknown failure");
        assert_eq!(err.kind(), "TRANSIENT_PEER");
    }
}
