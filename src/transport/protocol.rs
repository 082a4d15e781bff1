//! Peer Wire Protocol
//!
//! Two message families: `Gossip` datagrams (heartbeat + election, UDP,
//! best-effort) and framed `RpcRequest`/`RpcReply` pairs over TCP. Both are
//! versioned bincode payloads; RPC frames carry a crc32 checksum header.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::store::{SearchHit, StoredDocument};

/// Bump when a wire-incompatible change lands
pub const PROTOCOL_VERSION: u8 = 1;

/// Node id type; ids are totally ordered lexicographically
pub type NodeId = String;

/// Lightweight stats carried inside heartbeats
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GossipStats {
    pub doc_count: u64,
    pub term_count: u64,
    /// Normalized load in [0, 1]
    pub load_score: f64,
    /// XOR fold of held content hashes, drives anti-entropy
    pub doc_digest: u64,
}

/// Datagram messages for liveness and election. Best-effort: receivers must
/// tolerate loss, duplication, and reordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Gossip {
    Ping {
        sender_id: NodeId,
        term: u64,
        leader_id: Option<NodeId>,
        zone: Option<String>,
        /// RPC address of the sender, lets dynamically admitted peers be dialed
        rpc_addr: String,
        stats: GossipStats,
        /// Sender-side monotonic milliseconds; rejects reordered heartbeats
        monotonic_ts: u64,
    },
    Pong {
        sender_id: NodeId,
        term: u64,
        leader_id: Option<NodeId>,
        monotonic_ts: u64,
    },
    Election {
        sender_id: NodeId,
        term: u64,
    },
    ElectionOk {
        sender_id: NodeId,
        term: u64,
    },
    Coordinator {
        sender_id: NodeId,
        term: u64,
    },
}

impl Gossip {
    pub fn sender_id(&self) -> &NodeId {
        match self {
            Gossip::Ping { sender_id, .. }
            | Gossip::Pong { sender_id, .. }
            | Gossip::Election { sender_id, .. }
            | Gossip::ElectionOk { sender_id, .. }
            | Gossip::Coordinator { sender_id, .. } => sender_id,
        }
    }

    /// Message tag for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Gossip::Ping { .. } => "Ping",
            Gossip::Pong { .. } => "Pong",
            Gossip::Election { .. } => "Election",
            Gossip::ElectionOk { .. } => "ElectionOk",
            Gossip::Coordinator { .. } => "Coordinator",
        }
    }
}

/// Versioned envelope for a gossip datagram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipFrame {
    pub version: u8,
    pub msg: Gossip,
}

impl GossipFrame {
    pub fn new(msg: Gossip) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg,
        }
    }
}

/// A placement change reported to the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementUpdate {
    pub doc_id: String,
    pub fingerprint: Fingerprint,
    pub fingerprint_hash: u64,
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
    /// True when the primary rolled the write back; the leader drops the
    /// placement and remembers a tombstone
    pub retract: bool,
}

/// RPC request bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcBody {
    SearchLocal {
        query: String,
        k: usize,
    },
    ReplicateDoc {
        doc: StoredDocument,
        origin: NodeId,
    },
    RollbackDoc {
        doc_id: String,
    },
    LocateQuery {
        fingerprint: Fingerprint,
        max_candidates: usize,
        /// Nodes to skip (e.g., the primary when picking replicas)
        exclude: Vec<NodeId>,
        /// Apply the failure-domain spread hint while ranking
        spread_zones: bool,
    },
    PlacementUpdate(PlacementUpdate),
    DigestRequest,
    FetchDoc {
        doc_id: String,
    },
}

impl RpcBody {
    /// Message tag for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcBody::SearchLocal { .. } => "SearchLocal",
            RpcBody::ReplicateDoc { .. } => "ReplicateDoc",
            RpcBody::RollbackDoc { .. } => "RollbackDoc",
            RpcBody::LocateQuery { .. } => "LocateQuery",
            RpcBody::PlacementUpdate(_) => "PlacementUpdate",
            RpcBody::DigestRequest => "DigestRequest",
            RpcBody::FetchDoc { .. } => "FetchDoc",
        }
    }
}

/// RPC reply bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcOutcome {
    Ok,
    Ack,
    Nack { reason: String },
    Hits(Vec<SearchHit>),
    Candidates(Vec<NodeId>),
    Digest(HashMap<String, u64>),
    Document(StoredDocument),
    Error { kind: String, message: String },
}

/// One RPC call. `deadline_ms` is advisory: servers may shed work they cannot
/// finish in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Uuid,
    pub deadline_ms: u64,
    pub body: RpcBody,
}

impl RpcRequest {
    pub fn new(body: RpcBody, deadline_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            deadline_ms,
            body,
        }
    }
}

/// Every reply carries the server's believed leader and term so callers can
/// refresh their cache opportunistically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: Uuid,
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub body: RpcOutcome,
}

/// Frame header for length-prefixed RPC messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}
