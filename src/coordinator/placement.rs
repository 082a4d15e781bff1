//! Location Index
//!
//! Leader-only mapping from doc_id to the nodes that hold it, plus the
//! per-node aggregate fingerprints that drive candidate ranking. Held in
//! memory, snapshotted atomically to disk, and lazily repopulated from peer
//! digests after a leader change.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::fingerprint::{cosine_similarity, Fingerprint, FINGERPRINT_DIM};
use crate::state::PeerRecord;
use crate::transport::protocol::NodeId;

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot file name inside the snapshot directory
const SNAPSHOT_FILE: &str = "placements.snapshot";

/// How long a retracted doc_id stays tombstoned so anti-entropy does not
/// resurrect it from a node that missed the rollback
const TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Health of one placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementHealth {
    /// Full replication factor is live
    Healthy,
    /// Fewer live holders than the target
    UnderReplicated,
    /// No live holder at all
    Degraded,
}

/// Holder set for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub doc_id: String,
    pub fingerprint: Fingerprint,
    pub fingerprint_hash: u64,
    pub primary: NodeId,
    pub replicas: BTreeSet<NodeId>,
    pub replication_target: usize,
}

impl Placement {
    /// All holders: primary first, then replicas
    pub fn holders(&self) -> Vec<NodeId> {
        let mut holders = vec![self.primary.clone()];
        holders.extend(self.replicas.iter().cloned());
        holders
    }

    pub fn holds(&self, node_id: &str) -> bool {
        self.primary == node_id || self.replicas.contains(node_id)
    }

    pub fn health(&self, online: &HashSet<NodeId>) -> PlacementHealth {
        let live = self
            .holders()
            .into_iter()
            .filter(|h| online.contains(h))
            .count();
        if live == 0 {
            PlacementHealth::Degraded
        } else if live < self.replication_target {
            PlacementHealth::UnderReplicated
        } else {
            PlacementHealth::Healthy
        }
    }
}

/// Location index stats for /status
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PlacementStats {
    pub placements: usize,
    pub under_replicated: usize,
    pub degraded: usize,
}

/// Per-node sum of held-document fingerprints
#[derive(Debug, Clone, Default)]
struct Aggregate {
    sum: Vec<f32>,
    count: usize,
}

impl Aggregate {
    fn add(&mut self, fp: &Fingerprint) {
        if self.sum.is_empty() {
            self.sum = vec![0.0; FINGERPRINT_DIM];
        }
        for (s, x) in self.sum.iter_mut().zip(fp.iter()) {
            *s += x;
        }
        self.count += 1;
    }

    fn remove(&mut self, fp: &Fingerprint) {
        if self.sum.is_empty() || self.count == 0 {
            return;
        }
        for (s, x) in self.sum.iter_mut().zip(fp.iter()) {
            *s -= x;
        }
        self.count -= 1;
    }

    fn mean(&self) -> Option<Fingerprint> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum.iter().map(|s| s / self.count as f32).collect())
    }
}

/// On-disk snapshot layout
#[derive(Serialize, Deserialize)]
struct SnapshotFileBody {
    version: u32,
    generation: u64,
    saved_at_ms: i64,
    placements: Vec<Placement>,
}

/// Leader-side location index
pub struct LocationIndex {
    snapshot_dir: PathBuf,
    placements: RwLock<HashMap<String, Placement>>,
    aggregates: RwLock<HashMap<NodeId, Aggregate>>,
    /// Retracted doc_ids with retraction time
    tombstones: RwLock<HashMap<String, Instant>>,
    generation: AtomicU64,
}

impl LocationIndex {
    pub fn new(snapshot_dir: PathBuf) -> Self {
        Self {
            snapshot_dir,
            placements: RwLock::new(HashMap::new()),
            aggregates: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Create or replace a placement. Idempotent on identical inputs.
    pub async fn register(&self, placement: Placement) {
        let mut placements = self.placements.write().await;
        let mut aggregates = self.aggregates.write().await;

        if let Some(old) = placements.get(&placement.doc_id) {
            if old.primary == placement.primary
                && old.replicas == placement.replicas
                && old.fingerprint_hash == placement.fingerprint_hash
            {
                return;
            }
            for holder in old.holders() {
                if let Some(agg) = aggregates.get_mut(&holder) {
                    agg.remove(&old.fingerprint);
                }
            }
        }

        for holder in placement.holders() {
            aggregates.entry(holder).or_default().add(&placement.fingerprint);
        }

        self.tombstones.write().await.remove(&placement.doc_id);
        placements.insert(placement.doc_id.clone(), placement);
        gauge!("meshsearch.placements.total").set(placements.len() as f64);
    }

    /// Drop a placement and remember a tombstone so anti-entropy rolls the
    /// document back instead of re-adopting it
    pub async fn retract(&self, doc_id: &str) {
        let mut placements = self.placements.write().await;
        if let Some(old) = placements.remove(doc_id) {
            let mut aggregates = self.aggregates.write().await;
            for holder in old.holders() {
                if let Some(agg) = aggregates.get_mut(&holder) {
                    agg.remove(&old.fingerprint);
                }
            }
        }
        self.tombstones
            .write()
            .await
            .insert(doc_id.to_string(), Instant::now());
        gauge!("meshsearch.placements.total").set(placements.len() as f64);
    }

    pub async fn get(&self, doc_id: &str) -> Option<Placement> {
        self.placements.read().await.get(doc_id).cloned()
    }

    pub async fn is_tombstoned(&self, doc_id: &str) -> bool {
        self.tombstones.read().await.contains_key(doc_id)
    }

    /// Drop tombstones older than the TTL
    pub async fn prune_tombstones(&self) {
        let mut tombstones = self.tombstones.write().await;
        tombstones.retain(|_, at| at.elapsed() < TOMBSTONE_TTL);
    }

    /// Remove a node from every holder set. Documents whose primary was the
    /// removed node are re-primaried to the lowest online replica; with no
    /// online replica the placement is left primaryless-degraded in place
    /// (the old primary stays recorded so a rejoin can heal it).
    pub async fn remove_node(&self, node_id: &str, online: &HashSet<NodeId>) -> usize {
        let mut placements = self.placements.write().await;
        let mut aggregates = self.aggregates.write().await;
        let mut touched = 0usize;

        for placement in placements.values_mut() {
            if !placement.holds(node_id) {
                continue;
            }
            touched += 1;

            if placement.primary == node_id {
                let new_primary = placement
                    .replicas
                    .iter()
                    .filter(|r| online.contains(*r))
                    .min()
                    .cloned();
                match new_primary {
                    Some(new_primary) => {
                        placement.replicas.remove(&new_primary);
                        placement.primary = new_primary;
                        if let Some(agg) = aggregates.get_mut(node_id) {
                            agg.remove(&placement.fingerprint);
                        }
                    }
                    None => {
                        // No live replica to promote; keep holders as they
                        // are and let the repair pass heal on rejoin
                        tracing::warn!(doc_id = %placement.doc_id, "placement degraded: no online replica");
                        continue;
                    }
                }
            } else {
                placement.replicas.remove(node_id);
                if let Some(agg) = aggregates.get_mut(node_id) {
                    agg.remove(&placement.fingerprint);
                }
            }
        }

        touched
    }

    /// Rank candidate holder nodes for a fingerprint, best first.
    ///
    /// Scoring is cosine similarity between the query fingerprint and each
    /// node's aggregate mean fingerprint; ties break on lower load_score,
    /// then lexicographic node_id. Only ONLINE peers are considered. With
    /// `spread_zones`, candidates sharing a zone with an already-chosen node
    /// sink below candidates from fresh zones.
    pub async fn locate(
        &self,
        fingerprint: &Fingerprint,
        max_candidates: usize,
        exclude: &[NodeId],
        spread_zones: bool,
        online_peers: &[PeerRecord],
    ) -> Vec<NodeId> {
        let aggregates = self.aggregates.read().await;

        let mut scored: Vec<(&PeerRecord, f32)> = online_peers
            .iter()
            .filter(|p| !exclude.contains(&p.identity.node_id))
            .map(|p| {
                let score = aggregates
                    .get(&p.identity.node_id)
                    .and_then(|agg| agg.mean())
                    .map(|mean| cosine_similarity(fingerprint, &mean))
                    .unwrap_or(0.0);
                (p, score)
            })
            .collect();

        scored.sort_by(|(pa, sa), (pb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    pa.load_score
                        .partial_cmp(&pb.load_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| pa.identity.node_id.cmp(&pb.identity.node_id))
        });

        let picked = if spread_zones {
            spread_by_zone(&scored)
        } else {
            scored
                .iter()
                .map(|(p, _)| p.identity.node_id.clone())
                .collect()
        };

        picked.into_iter().take(max_candidates.max(1)).collect()
    }

    /// Placements with fewer live holders than their target; feeds repair
    pub async fn under_replicated(&self, online: &HashSet<NodeId>) -> Vec<Placement> {
        self.placements
            .read()
            .await
            .values()
            .filter(|p| p.health(online) == PlacementHealth::UnderReplicated)
            .cloned()
            .collect()
    }

    /// Doc ids that the index believes `node_id` holds
    pub async fn docs_held_by(&self, node_id: &str) -> HashMap<String, u64> {
        self.placements
            .read()
            .await
            .values()
            .filter(|p| p.holds(node_id))
            .map(|p| (p.doc_id.clone(), p.fingerprint_hash))
            .collect()
    }

    /// Expected digest fold for a peer, for comparison against heartbeats
    pub async fn expected_digest(&self, node_id: &str) -> u64 {
        crate::fingerprint::digest_fold(
            self.placements
                .read()
                .await
                .values()
                .filter(|p| p.holds(node_id))
                .map(|p| p.fingerprint_hash),
        )
    }

    pub async fn stats(&self, online: &HashSet<NodeId>) -> PlacementStats {
        let placements = self.placements.read().await;
        let mut stats = PlacementStats {
            placements: placements.len(),
            ..Default::default()
        };
        for placement in placements.values() {
            match placement.health(online) {
                PlacementHealth::UnderReplicated => stats.under_replicated += 1,
                PlacementHealth::Degraded => stats.degraded += 1,
                PlacementHealth::Healthy => {}
            }
        }
        stats
    }

    pub async fn all(&self) -> Vec<Placement> {
        let mut all: Vec<Placement> = self.placements.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        all
    }

    /// Write the snapshot atomically: temp file in the same directory, then
    /// rename over the previous one
    pub async fn save_snapshot(&self) -> Result<()> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let body = SnapshotFileBody {
            version: SNAPSHOT_VERSION,
            generation,
            saved_at_ms: chrono::Utc::now().timestamp_millis(),
            placements: self.placements.read().await.values().cloned().collect(),
        };

        let bytes = bincode::serialize(&body)?;
        let tmp = self.snapshot_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        let path = self.snapshot_dir.join(SNAPSHOT_FILE);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(generation, placements = body.placements.len(), "placement snapshot saved");
        Ok(())
    }

    /// Load the latest snapshot if one exists; aggregates are rebuilt
    pub async fn load_snapshot(&self) -> Result<usize> {
        let path = self.snapshot_dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(0);
        }

        let bytes = std::fs::read(&path)?;
        let body: SnapshotFileBody = bincode::deserialize(&bytes)
            .map_err(|e| Error::Snapshot(format!("unreadable snapshot: {}", e)))?;
        if body.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported snapshot version {}",
                body.version
            )));
        }

        let count = body.placements.len();
        let mut placements = self.placements.write().await;
        let mut aggregates = self.aggregates.write().await;
        placements.clear();
        aggregates.clear();
        for placement in body.placements {
            for holder in placement.holders() {
                aggregates.entry(holder).or_default().add(&placement.fingerprint);
            }
            placements.insert(placement.doc_id.clone(), placement);
        }
        self.generation.store(body.generation, Ordering::SeqCst);

        tracing::info!(
            generation = body.generation,
            placements = count,
            "placement snapshot loaded"
        );
        Ok(count)
    }
}

/// Greedy zone spread: walk the ranked list, preferring candidates whose
/// zone has not been chosen yet; same-zone candidates are appended after
fn spread_by_zone(scored: &[(&PeerRecord, f32)]) -> Vec<NodeId> {
    let mut chosen_zones: HashSet<String> = HashSet::new();
    let mut preferred = Vec::new();
    let mut deferred = Vec::new();

    for (peer, _) in scored {
        match &peer.zone {
            Some(zone) if chosen_zones.contains(zone) => {
                deferred.push(peer.identity.node_id.clone());
            }
            Some(zone) => {
                chosen_zones.insert(zone.clone());
                preferred.push(peer.identity.node_id.clone());
            }
            None => preferred.push(peer.identity.node_id.clone()),
        }
    }

    preferred.extend(deferred);
    preferred
}
