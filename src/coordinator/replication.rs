//! Replication Coordinator
//!
//! The document write path: the receiving node becomes the primary, indexes
//! locally, replicates to K-1 affinity-chosen followers, and commits the
//! moment a write quorum of holders acked. Failed quorums roll back
//! best-effort. A leader-side repair worker re-replicates under-replicated
//! placements and runs the digest-based anti-entropy pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use chrono::Utc;
use metrics::{counter, histogram};

use crate::cluster::PeerClient;
use crate::coordinator::placement::{LocationIndex, Placement};
use crate::coordinator::CoordinatorHandle;
use crate::error::{Error, Result};
use crate::fingerprint::{content_hash, Fingerprint, Vectorizer};
use crate::id::DocIdGenerator;
use crate::state::{ElectionView, Membership};
use crate::store::{IndexOutcome, SearchProvider, StoredDocument};
use crate::transport::protocol::{NodeId, PlacementUpdate};

/// A client write accepted by this node as primary
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Client-supplied id; generated when absent
    pub doc_id: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

/// Replication knobs resolved from config
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Total holders per document (primary included)
    pub factor: usize,
    /// Per-replica call deadline
    pub deadline: Duration,
    /// Concurrent background repair transfers
    pub repair_concurrency: usize,
}

impl ReplicationSettings {
    /// Write quorum: majority of K+1 rounded up
    pub fn quorum_target(&self) -> usize {
        self.factor / 2 + 1
    }
}

/// Tracks one in-flight write
struct Ticket {
    doc_id: String,
    quorum_target: usize,
    acks: HashSet<NodeId>,
    nacks: HashSet<NodeId>,
    conflicted: bool,
}

impl Ticket {
    fn new(doc_id: String, primary: NodeId, quorum_target: usize) -> Self {
        let mut acks = HashSet::new();
        // The primary's own durable commit counts as the first ack
        acks.insert(primary);
        Self {
            doc_id,
            quorum_target,
            acks,
            nacks: HashSet::new(),
            conflicted: false,
        }
    }

    fn committed(&self) -> bool {
        self.acks.len() >= self.quorum_target
    }
}

/// Releases the per-doc write slot on drop
struct InFlightGuard {
    in_flight: Arc<StdMutex<HashSet<String>>>,
    doc_id: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<StdMutex<HashSet<String>>>, doc_id: &str) -> Result<Self> {
        let mut set = in_flight.lock().expect("in-flight lock poisoned");
        if !set.insert(doc_id.to_string()) {
            return Err(Error::WriteInFlight(doc_id.to_string()));
        }
        Ok(Self {
            in_flight: Arc::clone(in_flight),
            doc_id: doc_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.doc_id);
        }
    }
}

/// Node-side replication coordinator; primary and follower duties both live
/// here, leader-only duties in `RepairWorker`
pub struct ReplicationCoordinator {
    self_id: NodeId,
    settings: ReplicationSettings,
    store: Arc<dyn SearchProvider>,
    vectorizer: Arc<dyn Vectorizer>,
    peers: Arc<dyn PeerClient>,
    membership: Arc<Membership>,
    election: watch::Receiver<ElectionView>,
    coordinator: Arc<CoordinatorHandle>,
    id_gen: DocIdGenerator,
    /// One in-flight ticket per doc_id on this primary
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

impl ReplicationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        settings: ReplicationSettings,
        store: Arc<dyn SearchProvider>,
        vectorizer: Arc<dyn Vectorizer>,
        peers: Arc<dyn PeerClient>,
        membership: Arc<Membership>,
        election: watch::Receiver<ElectionView>,
        coordinator: Arc<CoordinatorHandle>,
    ) -> Self {
        let id_gen = DocIdGenerator::new(&self_id);
        Self {
            self_id,
            settings,
            store,
            vectorizer,
            peers,
            membership,
            election,
            coordinator,
            id_gen,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Primary-side write path. Returns the committed doc_id or a typed
    /// failure after best-effort rollback.
    pub async fn write(&self, request: WriteRequest) -> Result<String> {
        let started = std::time::Instant::now();
        let doc_id = request
            .doc_id
            .clone()
            .unwrap_or_else(|| self.id_gen.generate().to_string());

        let _guard = InFlightGuard::acquire(&self.in_flight, &doc_id)?;

        let fingerprint = self.vectorizer.embed(&request.content).await?;
        let fingerprint_hash = content_hash(&request.content);

        // Re-submitting identical content is idempotent; different content
        // under the same id never overwrites
        if let Some(existing) = self.store.fingerprint_hash(&doc_id).await? {
            if existing == fingerprint_hash {
                return Ok(doc_id);
            }
            return Err(Error::Conflict { doc_id });
        }

        let size_bytes = request.content.len() as u64;
        let doc = StoredDocument {
            doc_id: doc_id.clone(),
            content: request.content,
            metadata: request.metadata,
            fingerprint: fingerprint.clone(),
            fingerprint_hash,
            size_bytes,
            created_at: Utc::now(),
        };

        if self.store.index(doc.clone()).await? == IndexOutcome::Duplicate {
            // Raced with a concurrent replica of the same doc; same content
            // is fine, anything else conflicts
            match self.store.fingerprint_hash(&doc_id).await? {
                Some(h) if h == fingerprint_hash => return Ok(doc_id),
                _ => return Err(Error::Conflict { doc_id }),
            }
        }

        let quorum_target = self.settings.quorum_target();
        let mut ticket = Ticket::new(doc_id.clone(), self.self_id.clone(), quorum_target);

        let targets = self.replica_targets(&fingerprint).await;
        let outcome = self
            .replicate_to(&doc, targets, &mut ticket)
            .await;

        match outcome {
            Ok(()) => {
                counter!("meshsearch.writes.committed").increment(1);
                histogram!("meshsearch.write.duration").record(started.elapsed().as_secs_f64());
                Ok(doc_id)
            }
            Err(e) => {
                counter!("meshsearch.writes.failed", "kind" => e.kind()).increment(1);
                self.rollback(&ticket).await;
                Err(e)
            }
        }
    }

    /// Fan the document out and decide the ticket. Commit happens the moment
    /// quorum acks arrive; remaining replies drain in the background.
    async fn replicate_to(
        &self,
        doc: &StoredDocument,
        targets: Vec<NodeId>,
        ticket: &mut Ticket,
    ) -> Result<()> {
        if ticket.committed() {
            // K = 1: the local commit already is the quorum
            self.report_commit(doc, ticket).await;
            return Ok(());
        }

        if targets.is_empty() {
            return Err(Error::QuorumFailed {
                acks: ticket.acks.len(),
                required: ticket.quorum_target,
            });
        }

        let (tx, mut rx) = mpsc::channel::<(NodeId, Result<()>)>(targets.len());
        let mut outstanding = targets.len();

        for target in targets {
            let peers = Arc::clone(&self.peers);
            let doc = doc.clone();
            let deadline = self.settings.deadline;
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = peers.replicate_doc(&target, &doc, deadline).await;
                let _ = tx.send((target, result)).await;
            });
        }
        drop(tx);

        while !ticket.committed() && outstanding > 0 {
            let Some((target, result)) = rx.recv().await else {
                break;
            };
            outstanding -= 1;
            match result {
                Ok(()) => {
                    ticket.acks.insert(target);
                }
                Err(e) if e.kind() == "CONFLICT" => {
                    tracing::warn!(doc_id = %ticket.doc_id, peer = %target, "replica rejected write as conflicting");
                    ticket.conflicted = true;
                    ticket.nacks.insert(target);
                }
                Err(e) => {
                    tracing::debug!(doc_id = %ticket.doc_id, peer = %target, "replica failed: {}", e);
                    ticket.nacks.insert(target);
                }
            }
        }

        if !ticket.committed() {
            if ticket.conflicted {
                return Err(Error::Conflict {
                    doc_id: ticket.doc_id.clone(),
                });
            }
            return Err(Error::QuorumFailed {
                acks: ticket.acks.len(),
                required: ticket.quorum_target,
            });
        }

        self.report_commit(doc, ticket).await;

        // Late replies keep improving the placement without blocking the client
        if outstanding > 0 {
            self.spawn_drain(doc.clone(), ticket.acks.clone(), rx);
        }

        Ok(())
    }

    /// Background task draining post-commit replies; every late ack widens
    /// the reported replica set
    fn spawn_drain(
        &self,
        doc: StoredDocument,
        mut acks: HashSet<NodeId>,
        mut rx: mpsc::Receiver<(NodeId, Result<()>)>,
    ) {
        let this = self.clone_refs();
        tokio::spawn(async move {
            while let Some((target, result)) = rx.recv().await {
                match result {
                    Ok(()) => {
                        acks.insert(target);
                        let update = placement_update_for(&this.self_id, &doc, &acks, false);
                        this.send_placement_update(update).await;
                    }
                    Err(e) => {
                        tracing::debug!(doc_id = %doc.doc_id, peer = %target, "late replica failure: {}", e);
                        // The leader's repair pass fills the gap
                    }
                }
            }
        });
    }

    /// Best-effort rollback of every acked holder, local copy included
    async fn rollback(&self, ticket: &Ticket) {
        counter!("meshsearch.writes.rollbacks").increment(1);
        for holder in &ticket.acks {
            if holder == &self.self_id {
                if let Err(e) = self.store.remove(&ticket.doc_id).await {
                    tracing::warn!(doc_id = %ticket.doc_id, "local rollback failed: {}", e);
                }
            } else if let Err(e) = self
                .peers
                .rollback_doc(holder, &ticket.doc_id, self.settings.deadline)
                .await
            {
                // Anti-entropy corrects holders that miss the rollback
                tracing::warn!(doc_id = %ticket.doc_id, peer = %holder, "rollback send failed: {}", e);
            }
        }

        let retract = PlacementUpdate {
            doc_id: ticket.doc_id.clone(),
            fingerprint: Vec::new(),
            fingerprint_hash: 0,
            primary: self.self_id.clone(),
            replicas: Vec::new(),
            retract: true,
        };
        self.send_placement_update(retract).await;
    }

    async fn report_commit(&self, doc: &StoredDocument, ticket: &Ticket) {
        let update = placement_update_for(&self.self_id, doc, &ticket.acks, false);
        self.send_placement_update(update).await;
    }

    /// Apply a placement update locally when this node leads, otherwise RPC
    /// it to the leader; failures are logged, digests heal later
    async fn send_placement_update(&self, update: PlacementUpdate) {
        if let Some(location) = self.coordinator.location().await {
            apply_placement_update(&location, self.settings.factor, update).await;
            return;
        }

        let leader = self.election.borrow().leader_id.clone();
        match leader {
            Some(leader) if leader != self.self_id => {
                if let Err(e) = self
                    .peers
                    .placement_update(&leader, update, self.settings.deadline)
                    .await
                {
                    tracing::warn!("placement update to leader {} failed: {}", leader, e);
                }
            }
            _ => {
                tracing::debug!("no reachable leader for placement update; digests will heal");
            }
        }
    }

    /// Pick K-1 replica targets: the leader ranks by affinity with the zone
    /// spread hint; with no reachable leader, fall back to the local
    /// membership view (AP)
    async fn replica_targets(&self, fingerprint: &Fingerprint) -> Vec<NodeId> {
        let want = self.settings.factor.saturating_sub(1);
        if want == 0 {
            return Vec::new();
        }
        let exclude = vec![self.self_id.clone()];

        if let Some(location) = self.coordinator.location().await {
            let online = self.membership.peers_online().await;
            return location
                .locate(fingerprint, want, &exclude, true, &online)
                .await;
        }

        let leader = self.election.borrow().leader_id.clone();
        if let Some(leader) = leader {
            if leader != self.self_id {
                match self
                    .peers
                    .locate_query(
                        &leader,
                        fingerprint,
                        want,
                        &exclude,
                        true,
                        self.settings.deadline,
                    )
                    .await
                {
                    Ok(candidates) => {
                        return candidates
                            .into_iter()
                            .filter(|c| c != &self.self_id)
                            .take(want)
                            .collect()
                    }
                    Err(e) => {
                        tracing::warn!("leader locate failed ({}), picking replicas locally", e);
                    }
                }
            }
        }

        // AP fallback: lowest-loaded online peers
        let mut online = self.membership.peers_online().await;
        online.retain(|p| p.identity.node_id != self.self_id);
        online.sort_by(|a, b| {
            a.load_score
                .partial_cmp(&b.load_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identity.node_id.cmp(&b.identity.node_id))
        });
        online
            .into_iter()
            .take(want)
            .map(|p| p.identity.node_id)
            .collect()
    }

    /// Follower side of `replicate_doc`
    pub async fn handle_replicate(&self, doc: StoredDocument) -> Result<()> {
        match self.store.fingerprint_hash(&doc.doc_id).await? {
            // Idempotent redelivery of the same content
            Some(existing) if existing == doc.fingerprint_hash => Ok(()),
            Some(_) => {
                counter!("meshsearch.replication.conflicts").increment(1);
                tracing::warn!(doc_id = %doc.doc_id, "rejecting conflicting replica");
                Err(Error::Conflict {
                    doc_id: doc.doc_id,
                })
            }
            None => {
                let doc_id = doc.doc_id.clone();
                match self.store.index(doc).await? {
                    IndexOutcome::Indexed => {
                        counter!("meshsearch.replication.accepted").increment(1);
                        Ok(())
                    }
                    IndexOutcome::Duplicate => {
                        // Raced with another writer between check and insert
                        Err(Error::Conflict { doc_id })
                    }
                }
            }
        }
    }

    /// Follower side of `rollback_doc`; idempotent by contract
    pub async fn handle_rollback(&self, doc_id: &str) -> Result<()> {
        let removed = self.store.remove(doc_id).await?;
        if removed {
            tracing::info!(doc_id, "rolled back replica");
        }
        Ok(())
    }

    fn clone_refs(&self) -> DrainContext {
        DrainContext {
            self_id: self.self_id.clone(),
            settings: self.settings.clone(),
            peers: Arc::clone(&self.peers),
            coordinator: Arc::clone(&self.coordinator),
            election: self.election.clone(),
        }
    }
}

/// Just enough context for the post-commit drain task
struct DrainContext {
    self_id: NodeId,
    settings: ReplicationSettings,
    peers: Arc<dyn PeerClient>,
    coordinator: Arc<CoordinatorHandle>,
    election: watch::Receiver<ElectionView>,
}

impl DrainContext {
    async fn send_placement_update(&self, update: PlacementUpdate) {
        if let Some(location) = self.coordinator.location().await {
            apply_placement_update(&location, self.settings.factor, update).await;
            return;
        }
        let leader = self.election.borrow().leader_id.clone();
        if let Some(leader) = leader {
            if leader != self.self_id {
                if let Err(e) = self
                    .peers
                    .placement_update(&leader, update, self.settings.deadline)
                    .await
                {
                    tracing::debug!("late placement update failed: {}", e);
                }
            }
        }
    }
}

fn placement_update_for(
    primary: &NodeId,
    doc: &StoredDocument,
    acks: &HashSet<NodeId>,
    retract: bool,
) -> PlacementUpdate {
    PlacementUpdate {
        doc_id: doc.doc_id.clone(),
        fingerprint: doc.fingerprint.clone(),
        fingerprint_hash: doc.fingerprint_hash,
        primary: primary.clone(),
        replicas: acks.iter().filter(|a| *a != primary).cloned().collect(),
        retract,
    }
}

/// Shared leader-side application of a placement update
pub async fn apply_placement_update(
    location: &LocationIndex,
    factor: usize,
    update: PlacementUpdate,
) {
    if update.retract {
        location.retract(&update.doc_id).await;
        return;
    }
    location
        .register(Placement {
            doc_id: update.doc_id,
            fingerprint: update.fingerprint,
            fingerprint_hash: update.fingerprint_hash,
            primary: update.primary,
            replicas: update.replicas.into_iter().collect(),
            replication_target: factor,
        })
        .await;
}

/// Leader-only background worker: re-replication of thin placements, node
/// removal on membership change, digest anti-entropy, periodic snapshots.
pub struct RepairWorker {
    pub self_id: NodeId,
    pub settings: ReplicationSettings,
    pub peers: Arc<dyn PeerClient>,
    pub membership: Arc<Membership>,
    pub location: Arc<LocationIndex>,
    pub snapshot_interval: Duration,
}

impl RepairWorker {
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut snapshots = self.membership.subscribe_raw();
        let mut ticker = tokio::time::interval(self.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut known_offline: HashSet<NodeId> = HashSet::new();

        loop {
            tokio::select! {
                snapshot = snapshots.recv() => {
                    let Ok(snapshot) = snapshot else { continue };
                    let online: HashSet<NodeId> = snapshot.online_ids().into_iter().collect();

                    for peer in snapshot.offline_ids() {
                        if known_offline.insert(peer.clone()) {
                            let touched = self.location.remove_node(&peer, &online).await;
                            if touched > 0 {
                                tracing::info!(peer = %peer, placements = touched, "removed offline node from placements");
                            }
                        }
                    }
                    known_offline.retain(|p| !online.contains(p));

                    self.repair_pass(&online).await;
                }
                _ = ticker.tick() => {
                    let online: HashSet<NodeId> =
                        self.membership.peers_online().await.into_iter()
                            .map(|p| p.identity.node_id).collect();
                    self.anti_entropy_pass().await;
                    self.repair_pass(&online).await;
                    self.location.prune_tombstones().await;
                    if let Err(e) = self.location.save_snapshot().await {
                        tracing::warn!("placement snapshot failed: {}", e);
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        tracing::debug!("repair worker stopped");
    }

    /// Re-replicate every under-replicated placement, bounded concurrency
    pub async fn repair_pass(&self, online: &HashSet<NodeId>) {
        let thin = self.location.under_replicated(online).await;
        if thin.is_empty() {
            return;
        }
        tracing::info!(count = thin.len(), "repairing under-replicated placements");

        let semaphore = Arc::new(Semaphore::new(self.settings.repair_concurrency.max(1)));
        let mut handles = Vec::new();

        for placement in thin {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = Arc::new(self.snapshot_refs());
            let online = online.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.repair_one(placement, &online).await;
            }));
        }

        futures::future::join_all(handles).await;
    }

    async fn repair_one(&self, placement: Placement, online: &HashSet<NodeId>) {
        let Some(source) = placement
            .holders()
            .into_iter()
            .find(|h| online.contains(h))
        else {
            tracing::warn!(doc_id = %placement.doc_id, "no online holder to repair from");
            return;
        };

        let online_peers = self.membership.peers_online().await;
        let exclude = placement.holders();
        let targets = self
            .location
            .locate(&placement.fingerprint, 1, &exclude, true, &online_peers)
            .await;
        let Some(target) = targets.into_iter().next() else {
            tracing::debug!(doc_id = %placement.doc_id, "no candidate target for repair");
            return;
        };

        let doc = if source == self.self_id {
            // The leader itself may hold the doc; no need to dial anyone
            match self.fetch_local(&placement.doc_id).await {
                Some(doc) => doc,
                None => return,
            }
        } else {
            match self
                .peers
                .fetch_doc(&source, &placement.doc_id, self.settings.deadline)
                .await
            {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(doc_id = %placement.doc_id, source = %source, "repair fetch failed: {}", e);
                    return;
                }
            }
        };

        match self
            .peers
            .replicate_doc(&target, &doc, self.settings.deadline)
            .await
        {
            Ok(()) => {
                counter!("meshsearch.replication.repairs").increment(1);
                let mut updated = placement.clone();
                updated.replicas.insert(target.clone());
                tracing::info!(doc_id = %placement.doc_id, target = %target, "replication repaired");
                self.location.register(updated).await;
            }
            Err(e) => {
                tracing::warn!(doc_id = %placement.doc_id, target = %target, "repair replicate failed: {}", e);
            }
        }
    }

    async fn fetch_local(&self, doc_id: &str) -> Option<StoredDocument> {
        // The worker deliberately has no store handle; leaders that hold the
        // doc are also listed as holders, so a peer fetch would loop back.
        // Route through the RPC client to ourselves instead.
        match self
            .peers
            .fetch_doc(&self.self_id, doc_id, self.settings.deadline)
            .await
        {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::warn!(doc_id, "local fetch for repair failed: {}", e);
                None
            }
        }
    }

    /// Compare each peer's heartbeat digest fold against the placement view
    /// and reconcile the ones that disagree
    pub async fn anti_entropy_pass(&self) {
        let peers = self.membership.peers_online().await;
        for peer in peers {
            let peer_id = peer.identity.node_id.clone();
            if peer_id == self.self_id {
                continue;
            }
            let expected = self.location.expected_digest(&peer_id).await;
            if expected == peer.doc_digest {
                continue;
            }

            tracing::debug!(peer = %peer_id, "digest mismatch, reconciling");
            match self
                .peers
                .digest_request(&peer_id, self.settings.deadline)
                .await
            {
                Ok(digest) => self.reconcile(&peer_id, digest).await,
                Err(e) => tracing::debug!(peer = %peer_id, "digest request failed: {}", e),
            }
        }
    }

    /// Fold one peer's digest into the placement view
    pub async fn reconcile(&self, peer_id: &NodeId, digest: std::collections::HashMap<String, u64>) {
        counter!("meshsearch.replication.reconciles").increment(1);

        // Documents the peer holds that the index does not know about
        for (doc_id, hash) in &digest {
            if self.location.is_tombstoned(doc_id).await {
                // The peer missed a rollback; finish it now
                tracing::info!(peer = %peer_id, doc_id = %doc_id, "rolling back tombstoned doc");
                let _ = self
                    .peers
                    .rollback_doc(peer_id, doc_id, self.settings.deadline)
                    .await;
                continue;
            }

            match self.location.get(doc_id).await {
                None => {
                    // Lost placement (leader change); adopt from the holder
                    match self
                        .peers
                        .fetch_doc(peer_id, doc_id, self.settings.deadline)
                        .await
                    {
                        Ok(doc) => {
                            tracing::info!(peer = %peer_id, doc_id = %doc_id, "adopting placement from holder digest");
                            self.location
                                .register(Placement {
                                    doc_id: doc.doc_id,
                                    fingerprint: doc.fingerprint,
                                    fingerprint_hash: doc.fingerprint_hash,
                                    primary: peer_id.clone(),
                                    replicas: Default::default(),
                                    replication_target: self.settings.factor,
                                })
                                .await;
                        }
                        Err(e) => {
                            tracing::debug!(doc_id = %doc_id, "adoption fetch failed: {}", e)
                        }
                    }
                }
                Some(placement) if !placement.holds(peer_id) => {
                    if placement.fingerprint_hash == *hash {
                        let mut updated = placement.clone();
                        updated.replicas.insert(peer_id.clone());
                        self.location.register(updated).await;
                    } else {
                        tracing::warn!(
                            peer = %peer_id,
                            doc_id = %doc_id,
                            "holder digest disagrees with placement fingerprint; doc_id collision"
                        );
                    }
                }
                Some(_) => {}
            }
        }

        // Documents the index thinks the peer holds but it does not
        let believed = self.location.docs_held_by(peer_id).await;
        for doc_id in believed.keys() {
            if digest.contains_key(doc_id) {
                continue;
            }
            let Some(placement) = self.location.get(doc_id).await else {
                continue;
            };
            let mut holders: Vec<NodeId> = placement
                .holders()
                .into_iter()
                .filter(|h| h != peer_id)
                .collect();
            if holders.is_empty() {
                tracing::warn!(doc_id = %doc_id, "last believed holder lost the doc; dropping placement");
                self.location.retract(doc_id).await;
                continue;
            }
            let primary = holders.remove(0);
            let mut updated = placement.clone();
            updated.primary = primary;
            updated.replicas = holders.into_iter().collect();
            self.location.register(updated).await;
        }
    }

    fn snapshot_refs(&self) -> RepairWorker {
        RepairWorker {
            self_id: self.self_id.clone(),
            settings: self.settings.clone(),
            peers: Arc::clone(&self.peers),
            membership: Arc::clone(&self.membership),
            location: Arc::clone(&self.location),
            snapshot_interval: self.snapshot_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::coordinator::CoordinatorServices;
    use crate::fingerprint::HashingVectorizer;
    use crate::state::membership::NodeIdentity;
    use crate::state::Role;
    use crate::store::{LocalStore, SearchHit};
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// In-memory peer fleet backed by real local stores
    struct FakePeers {
        stores: HashMap<NodeId, Arc<LocalStore>>,
        /// Peers that fail every call with a timeout
        dead: std::sync::Mutex<HashSet<NodeId>>,
        rollbacks: std::sync::Mutex<Vec<(NodeId, String)>>,
    }

    impl FakePeers {
        fn new(ids: &[&str]) -> Arc<Self> {
            let stores = ids
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        Arc::new(LocalStore::open_in_memory().unwrap()),
                    )
                })
                .collect();
            Arc::new(Self {
                stores,
                dead: std::sync::Mutex::new(HashSet::new()),
                rollbacks: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn kill(&self, id: &str) {
            self.dead.lock().unwrap().insert(id.to_string());
        }

        fn check_alive(&self, peer: &NodeId) -> Result<Arc<LocalStore>> {
            if self.dead.lock().unwrap().contains(peer) {
                return Err(Error::Timeout(peer.clone()));
            }
            self.stores
                .get(peer)
                .cloned()
                .ok_or_else(|| Error::UnknownPeer(peer.clone()))
        }

        async fn holds(&self, peer: &str, doc_id: &str) -> bool {
            self.stores[peer]
                .fingerprint_hash(doc_id)
                .await
                .unwrap()
                .is_some()
        }
    }

    #[async_trait::async_trait]
    impl crate::cluster::PeerClient for FakePeers {
        async fn search_local(
            &self,
            peer: &NodeId,
            query: &str,
            k: usize,
            _deadline: Duration,
        ) -> Result<Vec<SearchHit>> {
            self.check_alive(peer)?.search(query, k).await
        }

        async fn replicate_doc(
            &self,
            peer: &NodeId,
            doc: &StoredDocument,
            _deadline: Duration,
        ) -> Result<()> {
            let store = self.check_alive(peer)?;
            match store.fingerprint_hash(&doc.doc_id).await? {
                Some(h) if h == doc.fingerprint_hash => Ok(()),
                Some(_) => Err(Error::Conflict {
                    doc_id: doc.doc_id.clone(),
                }),
                None => {
                    store.index(doc.clone()).await?;
                    Ok(())
                }
            }
        }

        async fn rollback_doc(
            &self,
            peer: &NodeId,
            doc_id: &str,
            _deadline: Duration,
        ) -> Result<()> {
            self.rollbacks
                .lock()
                .unwrap()
                .push((peer.clone(), doc_id.to_string()));
            self.check_alive(peer)?.remove(doc_id).await?;
            Ok(())
        }

        async fn locate_query(
            &self,
            _peer: &NodeId,
            _fingerprint: &Fingerprint,
            _max_candidates: usize,
            _exclude: &[NodeId],
            _spread_zones: bool,
            _deadline: Duration,
        ) -> Result<Vec<NodeId>> {
            Err(Error::NoLeader)
        }

        async fn placement_update(
            &self,
            _peer: &NodeId,
            _update: PlacementUpdate,
            _deadline: Duration,
        ) -> Result<()> {
            Ok(())
        }

        async fn digest_request(
            &self,
            peer: &NodeId,
            _deadline: Duration,
        ) -> Result<std::collections::HashMap<String, u64>> {
            self.check_alive(peer)?.digest().await
        }

        async fn fetch_doc(
            &self,
            peer: &NodeId,
            doc_id: &str,
            _deadline: Duration,
        ) -> Result<StoredDocument> {
            self.check_alive(peer)?
                .fetch(doc_id)
                .await?
                .ok_or_else(|| Error::NotFound(doc_id.to_string()))
        }
    }

    fn identity(id: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: id.to_string(),
            rpc_addr: "127.0.0.1:5001".to_string(),
            heartbeat_addr: "127.0.0.1:5000".to_string(),
        }
    }

    fn peer(id: &str) -> PeerConfig {
        PeerConfig {
            id: id.to_string(),
            rpc_addr: "127.0.0.1:5001".to_string(),
            heartbeat_addr: "127.0.0.1:5000".to_string(),
        }
    }

    struct Harness {
        coordinator_handle: Arc<CoordinatorHandle>,
        membership: Arc<Membership>,
        peers: Arc<FakePeers>,
        replication: ReplicationCoordinator,
        self_store: Arc<LocalStore>,
    }

    /// Build a primary named "node-a" that is also the leader, with the
    /// given peers marked online
    async fn harness(factor: usize, peer_ids: &[&str], online: &[&str]) -> Harness {
        let membership = Arc::new(Membership::new(
            identity("node-a"),
            None,
            &peer_ids.iter().map(|p| peer(p)).collect::<Vec<_>>(),
            Duration::from_secs(15),
            false,
            peer_ids.len() + 1,
        ));
        for (i, id) in online.iter().enumerate() {
            membership
                .observe(id, None, None, None, None, (i + 1) as u64)
                .await;
        }

        let peers = FakePeers::new(
            &std::iter::once("node-a")
                .chain(peer_ids.iter().copied())
                .collect::<Vec<_>>(),
        );
        let self_store = Arc::clone(&peers.stores["node-a"]);

        let coordinator_handle = Arc::new(CoordinatorHandle::new());
        let location = Arc::new(LocationIndex::new(tempdir().unwrap().path().to_path_buf()));
        coordinator_handle
            .promote(CoordinatorServices::new(
                location,
                CancellationToken::new(),
                Vec::new(),
            ))
            .await;

        // Dropping the sender is fine: borrow() keeps returning the last view
        let (_view_tx, view_rx) = watch::channel(ElectionView {
            role: Role::Coordinator,
            term: 1,
            leader_id: Some("node-a".to_string()),
        });

        let store: Arc<dyn SearchProvider> = self_store.clone();
        let peer_client: Arc<dyn crate::cluster::PeerClient> = peers.clone();
        let replication = ReplicationCoordinator::new(
            "node-a".to_string(),
            ReplicationSettings {
                factor,
                deadline: Duration::from_millis(500),
                repair_concurrency: 2,
            },
            store,
            Arc::new(HashingVectorizer),
            peer_client,
            Arc::clone(&membership),
            view_rx,
            Arc::clone(&coordinator_handle),
        );

        Harness {
            coordinator_handle,
            membership,
            peers,
            replication,
            self_store,
        }
    }

    fn write(content: &str, doc_id: Option<&str>) -> WriteRequest {
        WriteRequest {
            doc_id: doc_id.map(|s| s.to_string()),
            content: content.to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_write_commits_with_quorum() {
        let h = harness(2, &["node-b"], &["node-b"]).await;

        let doc_id = h
            .replication
            .write(write("hello python world", Some("d1")))
            .await
            .unwrap();
        assert_eq!(doc_id, "d1");

        // Both the primary and the replica hold the doc at commit time
        assert!(h.peers.holds("node-a", "d1").await);
        assert!(h.peers.holds("node-b", "d1").await);

        // The leader learned the placement
        let location = h.coordinator_handle.location().await.unwrap();
        let placement = location.get("d1").await.unwrap();
        assert_eq!(placement.primary, "node-a");
        assert!(placement.replicas.contains("node-b"));
    }

    #[tokio::test]
    async fn test_write_fails_without_peers_and_rolls_back() {
        // K = 2 but the only peer is offline: quorum 2 is unreachable
        let h = harness(2, &["node-b"], &[]).await;
        h.peers.kill("node-b");

        let err = h
            .replication
            .write(write("doomed content", Some("d1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "WRITE_QUORUM_FAILED");

        // The local copy was removed; a search finds nothing
        assert!(!h.peers.holds("node-a", "d1").await);
        assert!(h.self_store.search("doomed", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_fails_when_replica_times_out() {
        let h = harness(2, &["node-b"], &["node-b"]).await;
        h.peers.kill("node-b");

        let err = h
            .replication
            .write(write("unlucky content", Some("d2")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "WRITE_QUORUM_FAILED");
        assert!(!h.peers.holds("node-a", "d2").await);
    }

    #[tokio::test]
    async fn test_conflicting_doc_id_is_rejected() {
        let h = harness(2, &["node-b"], &["node-b"]).await;

        // Another primary already replicated different content as d1 to b
        let other = StoredDocument {
            doc_id: "d1".to_string(),
            content: "the other write".to_string(),
            metadata: None,
            fingerprint: crate::fingerprint::HashingVectorizer
                .embed("the other write")
                .await
                .unwrap(),
            fingerprint_hash: content_hash("the other write"),
            size_bytes: 15,
            created_at: Utc::now(),
        };
        h.peers.stores["node-b"].index(other).await.unwrap();

        let err = h
            .replication
            .write(write("our write", Some("d1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CONFLICT");

        // The rejected content is gone from the primary; the winner stays
        assert!(!h.peers.holds("node-a", "d1").await);
        assert!(h.peers.holds("node-b", "d1").await);

        // Rollback was sent only to ackers, so node-b kept its copy
        let rollbacks = h.peers.rollbacks.lock().unwrap().clone();
        assert!(rollbacks.iter().all(|(peer, _)| peer != "node-b"));
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_idempotent() {
        let h = harness(2, &["node-b"], &["node-b"]).await;

        let first = h.replication.write(write("same body", Some("d1"))).await.unwrap();
        let second = h.replication.write(write("same body", Some("d1"))).await.unwrap();
        assert_eq!(first, second);

        let err = h
            .replication
            .write(write("different body", Some("d1")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_factor_one_commits_locally() {
        let h = harness(1, &[], &[]).await;
        let doc_id = h.replication.write(write("solo document", None)).await.unwrap();

        assert!(h.peers.holds("node-a", &doc_id).await);
        let location = h.coordinator_handle.location().await.unwrap();
        let placement = location.get(&doc_id).await.unwrap();
        assert!(placement.replicas.is_empty());
    }

    #[tokio::test]
    async fn test_quorum_two_of_three_survives_one_dead_replica() {
        let h = harness(3, &["node-b", "node-c"], &["node-b", "node-c"]).await;
        h.peers.kill("node-c");

        let doc_id = h
            .replication
            .write(write("resilient content", Some("d1")))
            .await
            .unwrap();

        // Quorum 2 = primary + node-b
        assert!(h.peers.holds("node-a", &doc_id).await);
        assert!(h.peers.holds("node-b", &doc_id).await);
        assert!(!h.peers.holds("node-c", &doc_id).await);
    }

    #[tokio::test]
    async fn test_follower_replicate_and_rollback() {
        let h = harness(2, &["node-b"], &["node-b"]).await;

        let doc = StoredDocument {
            doc_id: "r1".to_string(),
            content: "replicated body".to_string(),
            metadata: None,
            fingerprint: crate::fingerprint::HashingVectorizer
                .embed("replicated body")
                .await
                .unwrap(),
            fingerprint_hash: content_hash("replicated body"),
            size_bytes: 15,
            created_at: Utc::now(),
        };

        h.replication.handle_replicate(doc.clone()).await.unwrap();
        // Redelivery of the same content acks again
        h.replication.handle_replicate(doc.clone()).await.unwrap();

        // Different content under the same id is refused
        let mut conflicting = doc.clone();
        conflicting.content = "something else".to_string();
        conflicting.fingerprint_hash = content_hash("something else");
        let err = h.replication.handle_replicate(conflicting).await.unwrap_err();
        assert_eq!(err.kind(), "CONFLICT");

        // Rollback is idempotent
        h.replication.handle_rollback("r1").await.unwrap();
        h.replication.handle_rollback("r1").await.unwrap();
        assert!(!h.peers.holds("node-a", "r1").await);
    }

    #[tokio::test]
    async fn test_repair_fills_thin_placement() {
        let h = harness(2, &["node-b", "node-c"], &["node-b", "node-c"]).await;
        let location = h.coordinator_handle.location().await.unwrap();

        // node-b holds d1 alone; target is 2 holders
        let doc = StoredDocument {
            doc_id: "d1".to_string(),
            content: "repair me".to_string(),
            metadata: None,
            fingerprint: crate::fingerprint::HashingVectorizer
                .embed("repair me")
                .await
                .unwrap(),
            fingerprint_hash: content_hash("repair me"),
            size_bytes: 9,
            created_at: Utc::now(),
        };
        h.peers.stores["node-b"].index(doc.clone()).await.unwrap();
        location
            .register(Placement {
                doc_id: "d1".to_string(),
                fingerprint: doc.fingerprint.clone(),
                fingerprint_hash: doc.fingerprint_hash,
                primary: "node-b".to_string(),
                replicas: Default::default(),
                replication_target: 2,
            })
            .await;

        let worker = Arc::new(RepairWorker {
            self_id: "node-a".to_string(),
            settings: ReplicationSettings {
                factor: 2,
                deadline: Duration::from_millis(500),
                repair_concurrency: 2,
            },
            peers: h.peers.clone(),
            membership: Arc::clone(&h.membership),
            location: Arc::clone(&location),
            snapshot_interval: Duration::from_secs(60),
        });

        let online: HashSet<NodeId> = ["node-a", "node-b", "node-c"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        worker.repair_pass(&online).await;

        let placement = location.get("d1").await.unwrap();
        assert_eq!(placement.holders().len(), 2);
        // The new replica actually holds the content
        let new_holder = placement
            .holders()
            .into_iter()
            .find(|p| p != "node-b")
            .unwrap();
        assert!(h.peers.holds(&new_holder, "d1").await);
    }

    #[tokio::test]
    async fn test_anti_entropy_rolls_back_tombstoned_docs() {
        let h = harness(2, &["node-b"], &["node-b"]).await;
        let location = h.coordinator_handle.location().await.unwrap();

        // node-b holds a doc that the leader rolled back
        let doc = StoredDocument {
            doc_id: "ghost".to_string(),
            content: "should not exist".to_string(),
            metadata: None,
            fingerprint: crate::fingerprint::HashingVectorizer
                .embed("should not exist")
                .await
                .unwrap(),
            fingerprint_hash: content_hash("should not exist"),
            size_bytes: 16,
            created_at: Utc::now(),
        };
        h.peers.stores["node-b"].index(doc).await.unwrap();
        location.retract("ghost").await;

        let worker = Arc::new(RepairWorker {
            self_id: "node-a".to_string(),
            settings: ReplicationSettings {
                factor: 2,
                deadline: Duration::from_millis(500),
                repair_concurrency: 2,
            },
            peers: h.peers.clone(),
            membership: Arc::clone(&h.membership),
            location: Arc::clone(&location),
            snapshot_interval: Duration::from_secs(60),
        });

        let digest = h.peers.stores["node-b"].digest().await.unwrap();
        worker.reconcile(&"node-b".to_string(), digest).await;

        assert!(!h.peers.holds("node-b", "ghost").await);
    }

    #[tokio::test]
    async fn test_anti_entropy_adopts_unknown_docs() {
        let h = harness(2, &["node-b"], &["node-b"]).await;
        let location = h.coordinator_handle.location().await.unwrap();

        let doc = StoredDocument {
            doc_id: "orphan".to_string(),
            content: "survived a leader change".to_string(),
            metadata: None,
            fingerprint: crate::fingerprint::HashingVectorizer
                .embed("survived a leader change")
                .await
                .unwrap(),
            fingerprint_hash: content_hash("survived a leader change"),
            size_bytes: 24,
            created_at: Utc::now(),
        };
        h.peers.stores["node-b"].index(doc).await.unwrap();

        let worker = Arc::new(RepairWorker {
            self_id: "node-a".to_string(),
            settings: ReplicationSettings {
                factor: 2,
                deadline: Duration::from_millis(500),
                repair_concurrency: 2,
            },
            peers: h.peers.clone(),
            membership: Arc::clone(&h.membership),
            location: Arc::clone(&location),
            snapshot_interval: Duration::from_secs(60),
        });

        let digest = h.peers.stores["node-b"].digest().await.unwrap();
        worker.reconcile(&"node-b".to_string(), digest).await;

        let placement = location.get("orphan").await.unwrap();
        assert_eq!(placement.primary, "node-b");
    }

    #[test]
    fn test_quorum_targets() {
        let settings = |factor| ReplicationSettings {
            factor,
            deadline: Duration::from_secs(5),
            repair_concurrency: 1,
        };
        assert_eq!(settings(1).quorum_target(), 1);
        assert_eq!(settings(2).quorum_target(), 2);
        assert_eq!(settings(3).quorum_target(), 2);
        assert_eq!(settings(5).quorum_target(), 3);
    }
}
