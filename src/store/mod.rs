//! Local Document Store
//!
//! The per-node search provider: durable document storage plus a local
//! inverted index. The distributed core talks to it through the
//! `SearchProvider` trait, both for requests that originate here and for
//! replication/queries arriving from peers.

mod local;

pub use local::LocalStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// One search result from a local index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub score: f32,
    pub snippet: String,
}

/// Store statistics carried in heartbeats and /status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub doc_count: u64,
    pub term_count: u64,
}

/// A document as stored and as shipped between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub doc_id: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub fingerprint: Fingerprint,
    pub fingerprint_hash: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an index call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Document durably stored and indexed
    Indexed,
    /// A document with this id already exists; nothing was written
    Duplicate,
}

/// The local search provider contract.
///
/// Implementations must make `index` durable before returning and must never
/// block on the network from `search`.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn index(&self, doc: StoredDocument) -> Result<IndexOutcome>;

    /// Remove a document; `false` when it was not present
    async fn remove(&self, doc_id: &str) -> Result<bool>;

    /// Top-k local search, ordered by score descending with stable doc_id
    /// ascending tie-break
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Full document fetch, used as a re-replication source
    async fn fetch(&self, doc_id: &str) -> Result<Option<StoredDocument>>;

    /// Content hash of a held document, used for conflict checks
    async fn fingerprint_hash(&self, doc_id: &str) -> Result<Option<u64>>;

    /// Map of all held doc_ids to their content hashes (anti-entropy)
    async fn digest(&self) -> Result<HashMap<String, u64>>;

    /// XOR-fold over all held content hashes, cheap enough for heartbeats
    async fn digest_fold(&self) -> Result<u64>;
}
