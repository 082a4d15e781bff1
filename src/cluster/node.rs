//! Node Bootstrap & Runtime
//!
//! Wires every component together and owns the long-lived tasks: gossip
//! dispatch, heartbeat emission, the liveness scanner, the election task,
//! the role watcher that starts/stops coordinator services, and the RPC
//! server. Shutdown flows through one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use metrics::gauge;

use crate::api::HttpServer;
use crate::cluster::peers::{PeerClient, RpcPeerClient};
use crate::config::MeshConfig;
use crate::coordinator::{
    apply_placement_update, CoordinatorHandle, CoordinatorServices, LocationIndex, QueryRouter,
    RepairWorker, ReplicationCoordinator, ReplicationSettings,
};
use crate::error::{Error, Result};
use crate::fingerprint::{HashingVectorizer, Vectorizer};
use crate::state::{
    ElectionConfig, ElectionEvent, ElectionManager, ElectionView, GossipSender, Membership,
    NodeIdentity,
};
use crate::store::{LocalStore, SearchProvider};
use crate::transport::protocol::{Gossip, GossipStats, NodeId, RpcBody, RpcOutcome, RpcReply, RpcRequest};
use crate::transport::{DatagramTransport, RpcClient, RpcHandler, RpcServer};

/// Dial timeout for peer TCP connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Gossip dispatch channel depth
const GOSSIP_CHANNEL_CAPACITY: usize = 256;

/// Election event channel depth
const ELECTION_CHANNEL_CAPACITY: usize = 256;

/// A running MeshSearch node
pub struct Node {
    config: MeshConfig,
    membership: Arc<Membership>,
    store: Arc<dyn SearchProvider>,
    peers: Arc<dyn PeerClient>,
    coordinator: Arc<CoordinatorHandle>,
    replication: Arc<ReplicationCoordinator>,
    router: Arc<QueryRouter>,
    election_view: watch::Receiver<ElectionView>,
    datagram: Arc<DatagramTransport>,
    /// Process-monotonic base for heartbeat stamps
    boot: Instant,
    shutdown: CancellationToken,
}

impl Node {
    /// Build and start a node from its validated configuration. Returns once
    /// every background task is running.
    pub async fn start(config: MeshConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.node.data_dir)?;
        let shutdown = CancellationToken::new();

        let store: Arc<dyn SearchProvider> = Arc::new(LocalStore::open(&config.store_path())?);
        let vectorizer: Arc<dyn Vectorizer> = Arc::new(HashingVectorizer);

        let identity = NodeIdentity {
            node_id: config.node.id.clone(),
            rpc_addr: config.network.bind_rpc.clone(),
            heartbeat_addr: config.network.bind_heartbeat.clone(),
        };
        let membership = Arc::new(Membership::new(
            identity,
            config.node.zone.clone(),
            &config.cluster.peers,
            config.peer_timeout(),
            config.cluster.allow_dynamic_peers,
            config.cluster_size(),
        ));

        let datagram = Arc::new(DatagramTransport::bind(&config.network.bind_heartbeat).await?);

        let (election_tx, election_rx) = mpsc::channel(ELECTION_CHANNEL_CAPACITY);
        let gossip_sender: Arc<dyn GossipSender> = Arc::new(UdpGossipSender {
            membership: Arc::clone(&membership),
            datagram: Arc::clone(&datagram),
        });
        let (election, election_view) = ElectionManager::new(
            config.node.id.clone(),
            ElectionConfig {
                peer_timeout: config.peer_timeout(),
                election_timeout: config.election_timeout(),
                coordinator_wait: config.coordinator_wait(),
                bootstrap_grace: config.bootstrap_grace(),
            },
            Arc::clone(&membership),
            gossip_sender,
        );
        tokio::spawn(election.run(election_rx, shutdown.clone()));

        let rpc_client = RpcClient::new(CONNECT_TIMEOUT);
        let peers: Arc<dyn PeerClient> = Arc::new(RpcPeerClient::new(
            rpc_client,
            Arc::clone(&membership),
            election_tx.clone(),
        ));

        let coordinator = Arc::new(CoordinatorHandle::new());
        let settings = ReplicationSettings {
            factor: config.replication.factor,
            deadline: config.replication_deadline(),
            repair_concurrency: config.replication.repair_concurrency,
        };
        let replication = Arc::new(ReplicationCoordinator::new(
            config.node.id.clone(),
            settings.clone(),
            Arc::clone(&store),
            Arc::clone(&vectorizer),
            Arc::clone(&peers),
            Arc::clone(&membership),
            election_view.clone(),
            Arc::clone(&coordinator),
        ));
        let router = Arc::new(QueryRouter::new(
            config.node.id.clone(),
            config.query_deadline(),
            Arc::clone(&store),
            Arc::clone(&vectorizer),
            Arc::clone(&peers),
            Arc::clone(&membership),
            election_view.clone(),
            Arc::clone(&coordinator),
        ));

        let node = Arc::new(Self {
            config,
            membership,
            store,
            peers,
            coordinator,
            replication,
            router,
            election_view,
            datagram,
            boot: Instant::now(),
            shutdown,
        });

        node.spawn_gossip_dispatch(election_tx);
        node.spawn_heartbeat_emitter();
        node.spawn_scanner();
        node.spawn_role_watcher(settings);
        node.spawn_rpc_server()?;
        node.spawn_http_server();

        tracing::info!(node_id = %node.config.node.id, "node started");
        Ok(node)
    }

    /// Graceful shutdown: stop tasks, demote if leading (writes the final
    /// placement snapshot)
    pub async fn stop(&self) {
        tracing::info!("shutting down");
        self.shutdown.cancel();
        self.coordinator.demote().await;
    }

    /// Wait until the node is asked to stop
    pub async fn wait(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn coordinator(&self) -> &Arc<CoordinatorHandle> {
        &self.coordinator
    }

    pub fn replication(&self) -> &Arc<ReplicationCoordinator> {
        &self.replication
    }

    pub fn router(&self) -> &Arc<QueryRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn SearchProvider> {
        &self.store
    }

    pub fn election_view(&self) -> ElectionView {
        self.election_view.borrow().clone()
    }

    fn monotonic_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    /// Route incoming datagrams: heartbeats feed membership, election tags
    /// feed the election task
    fn spawn_gossip_dispatch(self: &Arc<Self>, election_tx: mpsc::Sender<ElectionEvent>) {
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Gossip)>(GOSSIP_CHANNEL_CAPACITY);
        self.datagram.spawn_receiver(tx, self.shutdown.clone());

        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((src, msg)) = rx.recv().await {
                match msg {
                    Gossip::Ping {
                        sender_id,
                        term,
                        leader_id,
                        zone,
                        rpc_addr,
                        stats,
                        monotonic_ts,
                    } => {
                        let dial_addr = resolve_advertised(&rpc_addr, src);
                        node.membership
                            .observe(
                                &sender_id,
                                zone,
                                Some(&dial_addr),
                                Some(&src.to_string()),
                                Some(stats),
                                monotonic_ts,
                            )
                            .await;

                        if let Some(leader_id) = leader_id {
                            let _ = election_tx.try_send(ElectionEvent::LeaderHint {
                                leader_id,
                                term,
                            });
                        }

                        let view = node.election_view.borrow().clone();
                        let pong = Gossip::Pong {
                            sender_id: node.config.node.id.clone(),
                            term: view.term,
                            leader_id: view.leader_id,
                            monotonic_ts: node.monotonic_ms(),
                        };
                        if let Err(e) = node.datagram.send(&src.to_string(), &pong).await {
                            tracing::trace!("pong to {} failed: {}", src, e);
                        }
                    }
                    Gossip::Pong {
                        sender_id,
                        term,
                        leader_id,
                        monotonic_ts,
                    } => {
                        node.membership
                            .observe(&sender_id, None, None, None, None, monotonic_ts)
                            .await;
                        if let Some(leader_id) = leader_id {
                            let _ = election_tx.try_send(ElectionEvent::LeaderHint {
                                leader_id,
                                term,
                            });
                        }
                    }
                    msg @ (Gossip::Election { .. }
                    | Gossip::ElectionOk { .. }
                    | Gossip::Coordinator { .. }) => {
                        let _ = election_tx.send(ElectionEvent::Datagram(msg)).await;
                    }
                }
            }
        });
    }

    /// Emit a heartbeat to every known peer each interval, carrying local
    /// stats, the load score, and the content digest fold
    fn spawn_heartbeat_emitter(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.heartbeat_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sys = sysinfo::System::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                sys.refresh_cpu_usage();
                let load_score =
                    (sys.global_cpu_info().cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);

                let stats = match node.store.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::warn!("store stats failed: {}", e);
                        continue;
                    }
                };
                let doc_digest = node.store.digest_fold().await.unwrap_or(0);

                let gossip_stats = GossipStats {
                    doc_count: stats.doc_count,
                    term_count: stats.term_count,
                    load_score,
                    doc_digest,
                };
                node.membership.update_self(gossip_stats).await;
                gauge!("meshsearch.node.load_score").set(load_score);
                gauge!("meshsearch.node.doc_count").set(stats.doc_count as f64);

                let view = node.election_view.borrow().clone();
                let ping = Gossip::Ping {
                    sender_id: node.config.node.id.clone(),
                    term: view.term,
                    leader_id: view.leader_id,
                    zone: node.config.node.zone.clone(),
                    rpc_addr: node.config.network.bind_rpc.clone(),
                    stats: gossip_stats,
                    monotonic_ts: node.monotonic_ms(),
                };

                for peer in node.membership.all_peers().await {
                    if peer.identity.node_id == node.config.node.id {
                        continue;
                    }
                    if let Err(e) = node
                        .datagram
                        .send(&peer.identity.heartbeat_addr, &ping)
                        .await
                    {
                        tracing::trace!("heartbeat to {} failed: {}", peer.identity.node_id, e);
                    }
                }
            }
        });
    }

    /// Evaluate peer liveness every half heartbeat interval
    fn spawn_scanner(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.heartbeat_interval() / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }
                node.membership.check_timeouts().await;
            }
        });
    }

    /// Start coordinator services on promotion, stop them on demotion
    fn spawn_role_watcher(self: &Arc<Self>, settings: ReplicationSettings) {
        let node = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let mut view_rx = self.election_view.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = view_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }

                let is_coordinator = view_rx.borrow().is_coordinator();
                let is_active = node.coordinator.is_active().await;

                if is_coordinator && !is_active {
                    node.promote_coordinator(settings.clone()).await;
                } else if !is_coordinator && is_active {
                    node.coordinator.demote().await;
                }
            }
        });
    }

    async fn promote_coordinator(&self, settings: ReplicationSettings) {
        let location = Arc::new(LocationIndex::new(self.config.snapshot_dir()));
        if let Err(e) = location.load_snapshot().await {
            tracing::warn!("placement snapshot load failed, starting empty: {}", e);
        }

        let cancel = self.shutdown.child_token();
        let worker = Arc::new(RepairWorker {
            self_id: self.config.node.id.clone(),
            settings,
            peers: Arc::clone(&self.peers),
            membership: Arc::clone(&self.membership),
            location: Arc::clone(&location),
            snapshot_interval: self.config.snapshot_interval(),
        });
        let tasks = vec![tokio::spawn(worker.run(cancel.clone()))];

        self.coordinator
            .promote(CoordinatorServices::new(location, cancel, tasks))
            .await;
    }

    fn spawn_rpc_server(self: &Arc<Self>) -> Result<()> {
        let handler = Arc::new(NodeRpcHandler {
            node: Arc::clone(self),
        });
        let server = RpcServer::new(
            self.config.network.bind_rpc.clone(),
            handler,
            self.shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("rpc server failed: {}", e);
            }
        });
        Ok(())
    }

    fn spawn_http_server(self: &Arc<Self>) {
        if !self.config.api.enabled {
            tracing::info!("http api disabled");
            return;
        }
        let server = HttpServer::new(Arc::clone(self));
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                tracing::error!("http server failed: {}", e);
            }
        });
    }
}

/// Election gossip rides the heartbeat socket; addresses resolve through
/// membership
struct UdpGossipSender {
    membership: Arc<Membership>,
    datagram: Arc<DatagramTransport>,
}

#[async_trait::async_trait]
impl GossipSender for UdpGossipSender {
    async fn send_to(&self, target: &NodeId, msg: Gossip) -> Result<()> {
        let addr = self
            .membership
            .get(target)
            .await
            .map(|p| p.identity.heartbeat_addr)
            .ok_or_else(|| Error::UnknownPeer(target.clone()))?;
        self.datagram.send(&addr, &msg).await
    }
}

/// Dispatches incoming peer RPCs into the node's components
struct NodeRpcHandler {
    node: Arc<Node>,
}

impl NodeRpcHandler {
    async fn dispatch(&self, request: RpcBody) -> RpcOutcome {
        match request {
            RpcBody::SearchLocal { query, k } => {
                match self.node.store.search(&query, k).await {
                    Ok(hits) => RpcOutcome::Hits(hits),
                    Err(e) => error_outcome(e),
                }
            }
            RpcBody::ReplicateDoc { doc, origin } => {
                tracing::debug!(doc_id = %doc.doc_id, origin = %origin, "replica request");
                match self.node.replication.handle_replicate(doc).await {
                    Ok(()) => RpcOutcome::Ack,
                    Err(Error::Conflict { doc_id }) => RpcOutcome::Nack {
                        reason: format!("conflicting fingerprint for {}", doc_id),
                    },
                    Err(e) => error_outcome(e),
                }
            }
            RpcBody::RollbackDoc { doc_id } => {
                match self.node.replication.handle_rollback(&doc_id).await {
                    Ok(()) => RpcOutcome::Ok,
                    Err(e) => error_outcome(e),
                }
            }
            RpcBody::LocateQuery {
                fingerprint,
                max_candidates,
                exclude,
                spread_zones,
            } => match self.node.coordinator.location().await {
                Some(location) => {
                    let online = self.node.membership.peers_online().await;
                    let candidates = location
                        .locate(&fingerprint, max_candidates, &exclude, spread_zones, &online)
                        .await;
                    RpcOutcome::Candidates(candidates)
                }
                None => error_outcome(Error::NotLeader {
                    leader: self.node.election_view().leader_id,
                }),
            },
            RpcBody::PlacementUpdate(update) => match self.node.coordinator.location().await {
                Some(location) => {
                    apply_placement_update(
                        &location,
                        self.node.config.replication.factor,
                        update,
                    )
                    .await;
                    RpcOutcome::Ok
                }
                None => error_outcome(Error::NotLeader {
                    leader: self.node.election_view().leader_id,
                }),
            },
            RpcBody::DigestRequest => match self.node.store.digest().await {
                Ok(digest) => RpcOutcome::Digest(digest),
                Err(e) => error_outcome(e),
            },
            RpcBody::FetchDoc { doc_id } => match self.node.store.fetch(&doc_id).await {
                Ok(Some(doc)) => RpcOutcome::Document(doc),
                Ok(None) => error_outcome(Error::NotFound(doc_id)),
                Err(e) => error_outcome(e),
            },
        }
    }
}

#[async_trait::async_trait]
impl RpcHandler for NodeRpcHandler {
    async fn handle(&self, _peer: SocketAddr, request: RpcRequest) -> RpcReply {
        let body = self.dispatch(request.body).await;
        let view = self.node.election_view();
        RpcReply {
            id: request.id,
            leader_id: view.leader_id,
            term: view.term,
            body,
        }
    }
}

fn error_outcome(e: Error) -> RpcOutcome {
    RpcOutcome::Error {
        kind: e.kind().to_string(),
        message: e.to_string(),
    }
}

/// Peers announce the rpc address they bound; a wildcard bind is only
/// dialable through the address the datagram actually came from
fn resolve_advertised(rpc_addr: &str, src: SocketAddr) -> String {
    match rpc_addr.rsplit_once(':') {
        Some((host, port)) if host == "0.0.0.0" || host == "[::]" || host == "::" => {
            format!("{}:{}", src.ip(), port)
        }
        _ => rpc_addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_advertised() {
        let src: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        assert_eq!(resolve_advertised("0.0.0.0:5001", src), "10.0.0.7:5001");
        assert_eq!(resolve_advertised("10.0.0.9:5001", src), "10.0.0.9:5001");
    }
}
