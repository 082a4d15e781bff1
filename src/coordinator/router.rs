//! Query Router
//!
//! Distributed search: embed the query, ask the leader which nodes are the
//! best holders, fan `search_local` out to them in parallel (the local index
//! always participates), then merge, dedup, rank, truncate, and label the
//! response with a freshness tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

use crate::cluster::PeerClient;
use crate::coordinator::CoordinatorHandle;
use crate::error::Result;
use crate::fingerprint::{Fingerprint, Vectorizer};
use crate::state::{AvailabilityMode, ElectionView, Freshness, FreshnessTracker, Membership};
use crate::store::{SearchHit, SearchProvider};
use crate::transport::protocol::NodeId;

/// Default number of candidate holders asked for per query
pub const DEFAULT_MAX_CANDIDATES: usize = 3;

/// One merged search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub score: f32,
    pub holder_node_id: NodeId,
    pub snippet: String,
}

/// The full search response returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub freshness: Freshness,
    pub availability_mode: AvailabilityMode,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub unavailable_nodes: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub staleness_warning: Option<String>,
}

/// Query router; lives on every node, coordinates through the leader
pub struct QueryRouter {
    self_id: NodeId,
    query_deadline: Duration,
    store: Arc<dyn SearchProvider>,
    vectorizer: Arc<dyn Vectorizer>,
    peers: Arc<dyn PeerClient>,
    membership: Arc<Membership>,
    election: watch::Receiver<ElectionView>,
    coordinator: Arc<CoordinatorHandle>,
    freshness: FreshnessTracker,
}

impl QueryRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        query_deadline: Duration,
        store: Arc<dyn SearchProvider>,
        vectorizer: Arc<dyn Vectorizer>,
        peers: Arc<dyn PeerClient>,
        membership: Arc<Membership>,
        election: watch::Receiver<ElectionView>,
        coordinator: Arc<CoordinatorHandle>,
    ) -> Self {
        let freshness = FreshnessTracker::new(membership.cluster_size());
        Self {
            self_id,
            query_deadline,
            store,
            vectorizer,
            peers,
            membership,
            election,
            coordinator,
            freshness,
        }
    }

    /// Execute one distributed search
    pub async fn search(&self, query: &str, max_results: usize) -> Result<SearchResponse> {
        let started = std::time::Instant::now();
        counter!("meshsearch.queries.total").increment(1);

        let fingerprint = self.vectorizer.embed(query).await?;
        let (candidates, mode) = self.candidates(&fingerprint).await;

        // Fan out to remote candidates; the local index always participates
        let mut calls = Vec::new();
        for candidate in candidates.iter().filter(|c| **c != self.self_id) {
            let peers = Arc::clone(&self.peers);
            let candidate = candidate.clone();
            let query = query.to_string();
            let deadline = self.query_deadline;
            calls.push(tokio::spawn(async move {
                let result = peers.search_local(&candidate, &query, max_results, deadline).await;
                (candidate, result)
            }));
        }
        let local = self.store.search(query, max_results).await;

        let mut gathered: Vec<(NodeId, Result<Vec<SearchHit>>)> =
            vec![(self.self_id.clone(), local)];
        for outcome in futures::future::join_all(calls).await {
            if let Ok(outcome) = outcome {
                gathered.push(outcome);
            }
        }

        let load_scores = self.load_scores().await;
        let (results, unavailable) = merge_hits(gathered, &load_scores, max_results);

        let view = self.election.borrow().clone();
        let snapshot = self.membership.current_snapshot().await;
        let degraded_for = self.membership.degraded_for().await;
        let (mut freshness, warning) =
            self.freshness
                .label(&snapshot, view.leader_known(), &unavailable, degraded_for);

        // On the leader the placement table can prove CONFIRMED wrong:
        // a contributing doc with an offline holder downgrades the tag
        if freshness == Freshness::Confirmed {
            if let Some(location) = self.coordinator.location().await {
                let online: std::collections::HashSet<NodeId> =
                    snapshot.online_ids().into_iter().collect();
                for result in &results {
                    if let Some(placement) = location.get(&result.doc_id).await {
                        if placement.holders().iter().any(|h| !online.contains(h)) {
                            freshness = Freshness::LikelyCurrent;
                            break;
                        }
                    }
                }
            }
        }

        // Everything failed and nothing local: empty AP answer, not an error
        if results.is_empty() && !unavailable.is_empty() {
            freshness = Freshness::Stale;
        }

        histogram!("meshsearch.query.duration").record(started.elapsed().as_secs_f64());
        histogram!("meshsearch.query.results").record(results.len() as f64);

        Ok(SearchResponse {
            results,
            freshness,
            availability_mode: mode,
            unavailable_nodes: unavailable,
            staleness_warning: warning,
        })
    }

    /// Candidate holders for this query: the leader's location index when
    /// reachable, otherwise every online peer (AP fallback)
    async fn candidates(&self, fingerprint: &Fingerprint) -> (Vec<NodeId>, AvailabilityMode) {
        if let Some(location) = self.coordinator.location().await {
            let online = self.membership.peers_online().await;
            let mut candidates = location
                .locate(fingerprint, DEFAULT_MAX_CANDIDATES, &[], false, &online)
                .await;
            if candidates.is_empty() {
                candidates = online.into_iter().map(|p| p.identity.node_id).collect();
            }
            return (candidates, AvailabilityMode::CpLike);
        }

        let leader = self.election.borrow().leader_id.clone();
        if let Some(leader) = leader {
            if leader != self.self_id {
                match self
                    .peers
                    .locate_query(
                        &leader,
                        fingerprint,
                        DEFAULT_MAX_CANDIDATES,
                        &[],
                        false,
                        self.query_deadline,
                    )
                    .await
                {
                    Ok(candidates) if !candidates.is_empty() => {
                        return (candidates, AvailabilityMode::CpLike)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("leader locate failed ({}), falling back to AP fan-out", e);
                    }
                }
            }
        }

        counter!("meshsearch.queries.ap_fallback").increment(1);
        let online = self.membership.peers_online().await;
        (
            online.into_iter().map(|p| p.identity.node_id).collect(),
            AvailabilityMode::Ap,
        )
    }

    async fn load_scores(&self) -> HashMap<NodeId, f64> {
        self.membership
            .all_peers()
            .await
            .into_iter()
            .map(|p| (p.identity.node_id, p.load_score))
            .collect()
    }
}

/// Merge per-node hit lists into one ranked response.
///
/// Duplicates of the same doc_id keep the maximum score and the holder with
/// the lowest load score. Ordering is score descending with a stable doc_id
/// ascending tie-break; the list is truncated to `max_results`. Candidates
/// that returned an error are collected into `unavailable`.
pub fn merge_hits(
    gathered: Vec<(NodeId, Result<Vec<SearchHit>>)>,
    load_scores: &HashMap<NodeId, f64>,
    max_results: usize,
) -> (Vec<SearchResult>, Vec<NodeId>) {
    struct Entry {
        score: f32,
        holder: NodeId,
        holder_load: f64,
        snippet: String,
    }

    let mut merged: HashMap<String, Entry> = HashMap::new();
    let mut unavailable = Vec::new();

    for (node, result) in gathered {
        let hits = match result {
            Ok(hits) => hits,
            Err(e) => {
                tracing::debug!(node = %node, "candidate dropped from merge: {}", e);
                unavailable.push(node);
                continue;
            }
        };
        let load = load_scores.get(&node).copied().unwrap_or(1.0);

        for hit in hits {
            match merged.get_mut(&hit.doc_id) {
                None => {
                    merged.insert(
                        hit.doc_id.clone(),
                        Entry {
                            score: hit.score,
                            holder: node.clone(),
                            holder_load: load,
                            snippet: hit.snippet,
                        },
                    );
                }
                Some(entry) => {
                    if hit.score > entry.score {
                        entry.score = hit.score;
                        entry.snippet = hit.snippet;
                    }
                    // Prefer the least-loaded holder; stable on node_id
                    if load < entry.holder_load
                        || (load == entry.holder_load && node < entry.holder)
                    {
                        entry.holder = node.clone();
                        entry.holder_load = load;
                    }
                }
            }
        }
    }

    let mut results: Vec<SearchResult> = merged
        .into_iter()
        .map(|(doc_id, entry)| SearchResult {
            doc_id,
            score: entry.score,
            holder_node_id: entry.holder,
            snippet: entry.snippet,
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    results.truncate(max_results);

    unavailable.sort_unstable();
    (results, unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn hit(doc_id: &str, score: f32) -> SearchHit {
        SearchHit {
            doc_id: doc_id.to_string(),
            score,
            snippet: format!("snippet of {}", doc_id),
        }
    }

    fn loads(pairs: &[(&str, f64)]) -> HashMap<NodeId, f64> {
        pairs.iter().map(|(n, l)| (n.to_string(), *l)).collect()
    }

    #[test]
    fn test_merge_orders_by_score_then_doc_id() {
        let gathered = vec![
            ("a".to_string(), Ok(vec![hit("d2", 0.5), hit("d1", 0.9)])),
            ("b".to_string(), Ok(vec![hit("d3", 0.5)])),
        ];
        let (results, unavailable) = merge_hits(gathered, &loads(&[]), 10);

        assert!(unavailable.is_empty());
        let ids: Vec<&str> = results.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_merge_dedups_keeping_max_score() {
        let gathered = vec![
            ("a".to_string(), Ok(vec![hit("d1", 0.4)])),
            ("b".to_string(), Ok(vec![hit("d1", 0.8)])),
        ];
        let (results, _) = merge_hits(gathered, &loads(&[("a", 0.2), ("b", 0.9)]), 10);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 0.8);
        // max score came from b, but the least-loaded holder wins the credit
        assert_eq!(results[0].holder_node_id, "a");
    }

    #[test]
    fn test_merge_holder_tie_breaks_on_node_id() {
        let gathered = vec![
            ("b".to_string(), Ok(vec![hit("d1", 0.5)])),
            ("a".to_string(), Ok(vec![hit("d1", 0.5)])),
        ];
        let (results, _) = merge_hits(gathered, &loads(&[("a", 0.3), ("b", 0.3)]), 10);
        assert_eq!(results[0].holder_node_id, "a");
    }

    #[test]
    fn test_merge_collects_unavailable() {
        let gathered = vec![
            ("a".to_string(), Ok(vec![hit("d1", 0.5)])),
            ("c".to_string(), Err(Error::Timeout("c".into()))),
            ("b".to_string(), Err(Error::PeerBusy("b".into()))),
        ];
        let (results, unavailable) = merge_hits(gathered, &loads(&[]), 10);

        assert_eq!(results.len(), 1);
        assert_eq!(unavailable, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_merge_truncates() {
        let gathered = vec![(
            "a".to_string(),
            Ok(vec![hit("d1", 0.9), hit("d2", 0.8), hit("d3", 0.7)]),
        )];
        let (results, _) = merge_hits(gathered, &loads(&[]), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].doc_id, "d1");
    }

    #[test]
    fn test_merge_empty_input() {
        let (results, unavailable) = merge_hits(Vec::new(), &loads(&[]), 5);
        assert!(results.is_empty());
        assert!(unavailable.is_empty());
    }

    mod end_to_end {
        use super::super::*;
        use crate::cluster::PeerClient;
        use crate::config::PeerConfig;
        use crate::coordinator::{CoordinatorServices, LocationIndex};
        use crate::error::Error;
        use crate::fingerprint::HashingVectorizer;
        use crate::state::membership::NodeIdentity;
        use crate::state::Role;
        use crate::store::{IndexOutcome, LocalStore, StoredDocument};
        use crate::transport::protocol::PlacementUpdate;
        use async_trait::async_trait;
        use std::collections::HashMap as StdHashMap;
        use std::time::Duration;
        use tempfile::tempdir;
        use tokio_util::sync::CancellationToken;

        /// Canned per-peer hit lists; listed "down" peers time out
        struct CannedPeers {
            hits: StdHashMap<NodeId, Vec<SearchHit>>,
            down: Vec<NodeId>,
        }

        #[async_trait]
        impl PeerClient for CannedPeers {
            async fn search_local(
                &self,
                peer: &NodeId,
                _query: &str,
                _k: usize,
                _deadline: Duration,
            ) -> crate::error::Result<Vec<SearchHit>> {
                if self.down.contains(peer) {
                    return Err(Error::Timeout(peer.clone()));
                }
                Ok(self.hits.get(peer).cloned().unwrap_or_default())
            }

            async fn replicate_doc(
                &self,
                _peer: &NodeId,
                _doc: &StoredDocument,
                _deadline: Duration,
            ) -> crate::error::Result<()> {
                unimplemented!("not used by the router")
            }

            async fn rollback_doc(
                &self,
                _peer: &NodeId,
                _doc_id: &str,
                _deadline: Duration,
            ) -> crate::error::Result<()> {
                unimplemented!("not used by the router")
            }

            async fn locate_query(
                &self,
                _peer: &NodeId,
                _fingerprint: &Fingerprint,
                _max_candidates: usize,
                _exclude: &[NodeId],
                _spread_zones: bool,
                _deadline: Duration,
            ) -> crate::error::Result<Vec<NodeId>> {
                Err(Error::Timeout("leader".into()))
            }

            async fn placement_update(
                &self,
                _peer: &NodeId,
                _update: PlacementUpdate,
                _deadline: Duration,
            ) -> crate::error::Result<()> {
                unimplemented!("not used by the router")
            }

            async fn digest_request(
                &self,
                _peer: &NodeId,
                _deadline: Duration,
            ) -> crate::error::Result<StdHashMap<String, u64>> {
                unimplemented!("not used by the router")
            }

            async fn fetch_doc(
                &self,
                _peer: &NodeId,
                _doc_id: &str,
                _deadline: Duration,
            ) -> crate::error::Result<StoredDocument> {
                unimplemented!("not used by the router")
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

        async fn local_store_with(docs: &[(&str, &str)]) -> Arc<LocalStore> {
            let store = Arc::new(LocalStore::open_in_memory().unwrap());
            for (doc_id, content) in docs {
                let outcome = store
                    .index(StoredDocument {
                        doc_id: doc_id.to_string(),
                        content: content.to_string(),
                        metadata: None,
                        fingerprint: HashingVectorizer.embed(content).await.unwrap(),
                        fingerprint_hash: crate::fingerprint::content_hash(content),
                        size_bytes: content.len() as u64,
                        created_at: chrono::Utc::now(),
                    })
                    .await
                    .unwrap();
                assert_eq!(outcome, IndexOutcome::Indexed);
            }
            store
        }

        async fn router(
            peers: Arc<CannedPeers>,
            store: Arc<LocalStore>,
            online: &[&str],
            leader: Option<&str>,
            leader_is_self: bool,
        ) -> QueryRouter {
            let membership = Arc::new(Membership::new(
                identity("node-a"),
                None,
                &["node-b", "node-c"].map(peer),
                Duration::from_secs(15),
                false,
                3,
            ));
            for (i, id) in online.iter().enumerate() {
                membership
                    .observe(id, None, None, None, None, (i + 1) as u64)
                    .await;
            }

            let coordinator = Arc::new(CoordinatorHandle::new());
            if leader_is_self {
                let location =
                    Arc::new(LocationIndex::new(tempdir().unwrap().path().to_path_buf()));
                coordinator
                    .promote(CoordinatorServices::new(
                        location,
                        CancellationToken::new(),
                        Vec::new(),
                    ))
                    .await;
            }

            let (_view_tx, view_rx) = watch::channel(ElectionView {
                role: if leader_is_self {
                    Role::Coordinator
                } else {
                    Role::Follower
                },
                term: 1,
                leader_id: leader.map(|l| l.to_string()),
            });

            QueryRouter::new(
                "node-a".to_string(),
                Duration::from_millis(500),
                store,
                Arc::new(HashingVectorizer),
                peers,
                membership,
                view_rx,
                coordinator,
            )
        }

        #[tokio::test]
        async fn test_search_merges_local_and_remote() {
            let peers = Arc::new(CannedPeers {
                hits: [(
                    "node-b".to_string(),
                    vec![SearchHit {
                        doc_id: "remote-1".to_string(),
                        score: 2.0,
                        snippet: "remote snippet".to_string(),
                    }],
                )]
                .into_iter()
                .collect(),
                down: Vec::new(),
            });
            let store = local_store_with(&[("local-1", "python programming notes")]).await;
            let router = router(peers, store, &["node-b", "node-c"], Some("node-a"), true).await;

            let response = router.search("python", 10).await.unwrap();

            let ids: Vec<&str> = response.results.iter().map(|r| r.doc_id.as_str()).collect();
            assert!(ids.contains(&"local-1"));
            assert_eq!(response.freshness, Freshness::Confirmed);
            assert_eq!(response.availability_mode, AvailabilityMode::CpLike);
            assert!(response.unavailable_nodes.is_empty());
        }

        #[tokio::test]
        async fn test_failed_candidate_is_reported() {
            let peers = Arc::new(CannedPeers {
                hits: StdHashMap::new(),
                down: vec!["node-b".to_string(), "node-c".to_string()],
            });
            let store = local_store_with(&[("local-1", "searchable text")]).await;
            let router = router(peers, store, &["node-b", "node-c"], Some("node-a"), true).await;

            let response = router.search("searchable", 10).await.unwrap();
            assert_eq!(response.results.len(), 1);
            assert_eq!(response.freshness, Freshness::LikelyCurrent);
            assert!(response
                .unavailable_nodes
                .contains(&"node-b".to_string()));
        }

        #[tokio::test]
        async fn test_unreachable_leader_falls_back_to_ap() {
            // Leader node-c cannot be reached for locate; the router fans out
            // to every online peer instead
            let peers = Arc::new(CannedPeers {
                hits: StdHashMap::new(),
                down: Vec::new(),
            });
            let store = local_store_with(&[("local-1", "fallback content")]).await;
            let router = router(peers, store, &["node-b"], Some("node-c"), false).await;

            let response = router.search("fallback", 10).await.unwrap();
            assert_eq!(response.availability_mode, AvailabilityMode::Ap);
            assert_eq!(response.results.len(), 1);
        }

        #[tokio::test]
        async fn test_all_failures_and_no_local_results_is_stale_not_error() {
            let peers = Arc::new(CannedPeers {
                hits: StdHashMap::new(),
                down: vec!["node-b".to_string(), "node-c".to_string()],
            });
            let store = Arc::new(LocalStore::open_in_memory().unwrap());
            let router = router(peers, store, &["node-b", "node-c"], Some("node-a"), true).await;

            let response = router.search("anything", 10).await.unwrap();
            assert!(response.results.is_empty());
            assert_eq!(response.freshness, Freshness::Stale);
        }
    }
}
