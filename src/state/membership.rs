//! Cluster Membership & Failure Detection
//!
//! The authoritative per-node view of which peers are alive. Heartbeat
//! observations flow in from the datagram transport; a scanner demotes peers
//! that go quiet. Every ONLINE/OFFLINE flip publishes an immutable
//! `MembershipSnapshot` with a strictly increasing generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use crate::config::PeerConfig;
use crate::transport::protocol::{GossipStats, NodeId};

/// Snapshot channel depth; a subscriber that lags this far resynchronizes
/// from the current snapshot
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Peer liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Known from config but never heard from
    Starting,
    /// Heartbeats arriving within the timeout
    Online,
    /// Half the timeout elapsed without a heartbeat; observability only
    Suspected,
    /// Timed out or never seen
    Offline,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Starting => write!(f, "STARTING"),
            PeerStatus::Online => write!(f, "ONLINE"),
            PeerStatus::Suspected => write!(f, "SUSPECTED"),
            PeerStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Immutable node addressing, fixed at boot (or first sight for dynamic peers)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub rpc_addr: String,
    pub heartbeat_addr: String,
}

/// State of a single peer (including self)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: NodeIdentity,
    pub status: PeerStatus,
    /// Last heartbeat receive time (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    /// Highest sender-side monotonic stamp seen; rejects reordered heartbeats
    pub last_monotonic_ts: u64,
    pub doc_count: u64,
    pub term_count: u64,
    pub load_score: f64,
    pub zone: Option<String>,
    /// XOR fold of the peer's held content hashes
    pub doc_digest: u64,
}

impl PeerRecord {
    fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            status: PeerStatus::Starting,
            last_heartbeat: None,
            last_monotonic_ts: 0,
            doc_count: 0,
            term_count: 0,
            load_score: 0.0,
            zone: None,
            doc_digest: 0,
        }
    }

    /// Time since the last heartbeat was received
    pub fn age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// Whether the peer counts as live. Suspicion is advisory only: a
    /// suspected peer stays in the online set until it actually times out.
    pub fn is_online(&self) -> bool {
        matches!(self.status, PeerStatus::Online | PeerStatus::Suspected)
    }
}

/// Immutable membership view published to subscribers
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    /// Strictly increasing across snapshots from one node
    pub generation: u64,
    /// All known peers including self, sorted by node_id
    pub peers: Vec<PeerRecord>,
}

impl MembershipSnapshot {
    pub fn online_ids(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|p| p.is_online())
            .map(|p| p.identity.node_id.clone())
            .collect()
    }

    pub fn offline_ids(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|p| !p.is_online())
            .map(|p| p.identity.node_id.clone())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_online()).count()
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.identity.node_id == node_id)
    }
}

/// Cluster membership tracker. Single writer (the node's gossip dispatcher
/// and scanner); readers take snapshots.
pub struct Membership {
    self_id: NodeId,
    peer_timeout: Duration,
    allow_dynamic_peers: bool,
    nodes: RwLock<HashMap<NodeId, PeerRecord>>,
    generation: AtomicU64,
    snapshot_tx: broadcast::Sender<MembershipSnapshot>,
    /// When the online set last dropped below majority; feeds the
    /// partition-age part of staleness warnings
    degraded_since: RwLock<Option<Instant>>,
    /// Configured cluster size for majority math
    cluster_size: usize,
}

impl Membership {
    pub fn new(
        self_identity: NodeIdentity,
        zone: Option<String>,
        peers: &[PeerConfig],
        peer_timeout: Duration,
        allow_dynamic_peers: bool,
        cluster_size: usize,
    ) -> Self {
        let mut nodes = HashMap::new();

        let self_id = self_identity.node_id.clone();
        let mut self_record = PeerRecord::new(self_identity);
        self_record.status = PeerStatus::Online;
        self_record.last_heartbeat = Some(Instant::now());
        self_record.zone = zone;
        nodes.insert(self_id.clone(), self_record);

        for peer in peers {
            nodes.insert(
                peer.id.clone(),
                PeerRecord::new(NodeIdentity {
                    node_id: peer.id.clone(),
                    rpc_addr: peer.rpc_addr.clone(),
                    heartbeat_addr: peer.heartbeat_addr.clone(),
                }),
            );
        }

        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

        Self {
            self_id,
            peer_timeout,
            allow_dynamic_peers,
            nodes: RwLock::new(nodes),
            generation: AtomicU64::new(0),
            snapshot_tx,
            degraded_since: RwLock::new(None),
            cluster_size,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Majority of the configured cluster
    pub fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Record a received heartbeat. Duplicates and reordered datagrams are
    /// idempotent: only a strictly newer monotonic stamp moves state.
    pub async fn observe(
        &self,
        sender_id: &str,
        zone: Option<String>,
        rpc_addr: Option<&str>,
        heartbeat_addr: Option<&str>,
        stats: Option<GossipStats>,
        monotonic_ts: u64,
    ) {
        if sender_id == self.self_id {
            tracing::warn!("discarding heartbeat carrying our own node id");
            return;
        }

        let mut came_online = false;
        {
            let mut nodes = self.nodes.write().await;
            if !nodes.contains_key(sender_id) {
                if !self.allow_dynamic_peers {
                    tracing::warn!("discarding heartbeat from unknown peer {}", sender_id);
                    return;
                }
                let (Some(rpc), Some(hb)) = (rpc_addr, heartbeat_addr) else {
                    tracing::warn!(
                        "dynamic peer {} sent no dialable address, discarding",
                        sender_id
                    );
                    return;
                };
                tracing::info!("admitting dynamic peer {} at {}", sender_id, rpc);
                nodes.insert(
                    sender_id.to_string(),
                    PeerRecord::new(NodeIdentity {
                        node_id: sender_id.to_string(),
                        rpc_addr: rpc.to_string(),
                        heartbeat_addr: hb.to_string(),
                    }),
                );
            }
            let Some(record) = nodes.get_mut(sender_id) else {
                return;
            };

            if monotonic_ts <= record.last_monotonic_ts {
                // Duplicate or reordered datagram
                return;
            }
            record.last_monotonic_ts = monotonic_ts;
            record.last_heartbeat = Some(Instant::now());

            if let Some(stats) = stats {
                record.doc_count = stats.doc_count;
                record.term_count = stats.term_count;
                record.load_score = stats.load_score;
                record.doc_digest = stats.doc_digest;
            }
            if zone.is_some() {
                record.zone = zone;
            }

            if record.status != PeerStatus::Online {
                // Clearing suspicion is not a membership change; only a peer
                // that was actually out of the online set emits a snapshot
                let was_online = record.is_online();
                if !was_online {
                    tracing::info!(
                        peer = sender_id,
                        prior = %record.status,
                        "peer is now online"
                    );
                }
                record.status = PeerStatus::Online;
                came_online = !was_online;
            }
        }

        if came_online {
            counter!("meshsearch.membership.transitions", "to" => "online").increment(1);
            self.emit_snapshot().await;
        }
    }

    /// Scanner body, runs every half heartbeat interval. Demotes peers whose
    /// heartbeats aged out and publishes a snapshot when the online set
    /// changed. Never blocks on I/O.
    pub async fn check_timeouts(&self) -> Vec<NodeId> {
        let mut went_offline = Vec::new();
        {
            let mut nodes = self.nodes.write().await;
            for (id, record) in nodes.iter_mut() {
                if id == &self.self_id {
                    continue;
                }
                let Some(age) = record.age() else {
                    continue; // never heard from; stays Starting/Offline
                };

                match record.status {
                    PeerStatus::Online if age >= self.peer_timeout => {
                        tracing::warn!(peer = %id, age_ms = age.as_millis() as u64, "peer timed out");
                        record.status = PeerStatus::Offline;
                        went_offline.push(id.clone());
                    }
                    PeerStatus::Online if age >= self.peer_timeout / 2 => {
                        record.status = PeerStatus::Suspected;
                    }
                    PeerStatus::Suspected if age >= self.peer_timeout => {
                        tracing::warn!(peer = %id, age_ms = age.as_millis() as u64, "peer timed out");
                        record.status = PeerStatus::Offline;
                        went_offline.push(id.clone());
                    }
                    _ => {}
                }
            }
        }

        if !went_offline.is_empty() {
            counter!("meshsearch.membership.transitions", "to" => "offline")
                .increment(went_offline.len() as u64);
            self.emit_snapshot().await;
        }

        // Track how long we have been below majority for staleness warnings
        let online = self.online_count().await;
        let mut degraded = self.degraded_since.write().await;
        if online < self.majority() {
            degraded.get_or_insert_with(Instant::now);
        } else {
            *degraded = None;
        }

        went_offline
    }

    /// All peers currently ONLINE (including self), sorted by node_id
    pub async fn peers_online(&self) -> Vec<PeerRecord> {
        let nodes = self.nodes.read().await;
        let mut online: Vec<PeerRecord> = nodes.values().filter(|p| p.is_online()).cloned().collect();
        online.sort_by(|a, b| a.identity.node_id.cmp(&b.identity.node_id));
        online
    }

    /// All known peers (including self), sorted by node_id
    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<PeerRecord> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.identity.node_id.cmp(&b.identity.node_id));
        all
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerRecord> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// RPC address of a peer, if known
    pub async fn rpc_addr(&self, node_id: &str) -> Option<String> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .map(|p| p.identity.rpc_addr.clone())
    }

    pub async fn online_count(&self) -> usize {
        self.nodes.read().await.values().filter(|p| p.is_online()).count()
    }

    /// Refresh this node's own stats so they ride the next heartbeat and
    /// show up in /status
    pub async fn update_self(&self, stats: GossipStats) {
        let mut nodes = self.nodes.write().await;
        if let Some(record) = nodes.get_mut(&self.self_id) {
            record.doc_count = stats.doc_count;
            record.term_count = stats.term_count;
            record.load_score = stats.load_score;
            record.doc_digest = stats.doc_digest;
            record.last_heartbeat = Some(Instant::now());
        }
    }

    /// Subscribe to membership snapshots, starting from the current state
    pub fn subscribe(&self) -> BroadcastStream<MembershipSnapshot> {
        BroadcastStream::new(self.snapshot_tx.subscribe())
    }

    /// Raw broadcast receiver for select!-based consumers
    pub fn subscribe_raw(&self) -> broadcast::Receiver<MembershipSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current membership as a snapshot without publishing it
    pub async fn current_snapshot(&self) -> MembershipSnapshot {
        MembershipSnapshot {
            generation: self.generation.load(Ordering::SeqCst),
            peers: self.all_peers().await,
        }
    }

    /// How long the node has been below majority, if it is
    pub async fn degraded_for(&self) -> Option<Duration> {
        self.degraded_since.read().await.map(|t| t.elapsed())
    }

    async fn emit_snapshot(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = MembershipSnapshot {
            generation,
            peers: self.all_peers().await,
        };
        gauge!("meshsearch.membership.online").set(snapshot.online_count() as f64);
        tracing::debug!(
            generation,
            online = snapshot.online_count(),
            "membership snapshot"
        );
        // No receivers is fine; subscribers may come and go
        let _ = self.snapshot_tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: id.to_string(),
            rpc_addr: format!("127.0.0.1:5{}01", id.len()),
            heartbeat_addr: format!("127.0.0.1:5{}00", id.len()),
        }
    }

    fn peer(id: &str) -> PeerConfig {
        PeerConfig {
            id: id.to_string(),
            rpc_addr: "127.0.0.1:5001".to_string(),
            heartbeat_addr: "127.0.0.1:5000".to_string(),
        }
    }

    fn membership(timeout_ms: u64) -> Membership {
        Membership::new(
            identity("node-1"),
            None,
            &[peer("node-2"), peer("node-3")],
            Duration::from_millis(timeout_ms),
            false,
            3,
        )
    }

    #[tokio::test]
    async fn test_observe_brings_peer_online() {
        let m = membership(300);
        assert_eq!(m.online_count().await, 1); // just self

        m.observe("node-2", None, None, None, None, 1).await;
        assert_eq!(m.online_count().await, 2);

        let online = m.peers_online().await;
        assert_eq!(online.len(), 2);
        // stable sort by node_id
        assert_eq!(online[0].identity.node_id, "node-1");
        assert_eq!(online[1].identity.node_id, "node-2");
    }

    #[tokio::test]
    async fn test_reordered_heartbeats_are_idempotent() {
        let m = membership(300);
        m.observe(
            "node-2",
            None,
            None,
            None,
            Some(GossipStats {
                doc_count: 5,
                ..Default::default()
            }),
            10,
        )
        .await;

        // An older datagram arrives late; it must not move anything
        m.observe(
            "node-2",
            None,
            None,
            None,
            Some(GossipStats {
                doc_count: 1,
                ..Default::default()
            }),
            7,
        )
        .await;

        let record = m.get("node-2").await.unwrap();
        assert_eq!(record.last_monotonic_ts, 10);
        assert_eq!(record.doc_count, 5);
    }

    #[tokio::test]
    async fn test_own_id_is_discarded() {
        let m = membership(300);
        let before = m.get("node-1").await.unwrap().last_monotonic_ts;
        m.observe("node-1", None, None, None, None, 99).await;
        assert_eq!(m.get("node-1").await.unwrap().last_monotonic_ts, before);
    }

    #[tokio::test]
    async fn test_unknown_peer_requires_dynamic_flag() {
        let m = membership(300);
        m.observe("node-9", None, Some("127.0.0.1:9001"), Some("127.0.0.1:9000"), None, 1)
            .await;
        assert!(m.get("node-9").await.is_none());

        let dynamic = Membership::new(
            identity("node-1"),
            None,
            &[],
            Duration::from_millis(300),
            true,
            3,
        );
        dynamic
            .observe("node-9", None, Some("127.0.0.1:9001"), Some("127.0.0.1:9000"), None, 1)
            .await;
        let record = dynamic.get("node-9").await.unwrap();
        assert_eq!(record.identity.rpc_addr, "127.0.0.1:9001");
        assert!(record.is_online());
    }

    #[tokio::test]
    async fn test_timeout_takes_peer_offline_and_back() {
        let m = membership(100);
        m.observe("node-2", None, None, None, None, 1).await;
        assert!(m.get("node-2").await.unwrap().is_online());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let offline = m.check_timeouts().await;
        assert_eq!(offline, vec!["node-2".to_string()]);
        assert_eq!(m.get("node-2").await.unwrap().status, PeerStatus::Offline);

        // A fresh heartbeat brings it back
        m.observe("node-2", None, None, None, None, 2).await;
        assert!(m.get("node-2").await.unwrap().is_online());
    }

    #[tokio::test]
    async fn test_suspected_is_internal_only() {
        let m = membership(200);
        m.observe("node-2", None, None, None, None, 1).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let offline = m.check_timeouts().await;
        assert!(offline.is_empty());
        assert_eq!(m.get("node-2").await.unwrap().status, PeerStatus::Suspected);
        // Suspicion has no external effect: the peer still counts as online
        assert_eq!(m.online_count().await, 2);
        assert!(m.get("node-2").await.unwrap().is_online());
    }

    #[tokio::test]
    async fn test_snapshot_generations_increase() {
        let m = membership(100);
        let mut rx = m.subscribe_raw();

        m.observe("node-2", None, None, None, None, 1).await;
        let first = rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        m.check_timeouts().await;
        let second = rx.recv().await.unwrap();

        assert!(second.generation > first.generation);
        assert_eq!(first.online_count(), 2);
        assert_eq!(second.online_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_observe_emits_no_snapshot() {
        let m = membership(300);
        let mut rx = m.subscribe_raw();

        m.observe("node-2", None, None, None, None, 1).await;
        let _ = rx.recv().await.unwrap();

        // Same peer, newer stamp, already online: no transition, no snapshot
        m.observe("node-2", None, None, None, None, 2).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
