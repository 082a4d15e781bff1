//! Leader Election
//!
//! Bully-style election over the gossip transport. Node ids are totally
//! ordered; the highest live id wins. The whole state machine is confined to
//! one task; other components observe it through a watch channel and feed it
//! events through an mpsc inbox.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use metrics::counter;
use rand::Rng;

use crate::error::Result;
use crate::state::Membership;
use crate::transport::protocol::{Gossip, NodeId};

/// Election role
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Coordinator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Coordinator => write!(f, "COORDINATOR"),
        }
    }
}

/// Election state observable by the rest of the node
#[derive(Debug, Clone)]
pub struct ElectionView {
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
}

impl ElectionView {
    pub fn leader_known(&self) -> bool {
        self.leader_id.is_some()
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }
}

/// Events fed into the election task
#[derive(Debug)]
pub enum ElectionEvent {
    /// An election-related datagram arrived
    Datagram(Gossip),
    /// A leader/term hint seen in an RPC reply or heartbeat
    LeaderHint { leader_id: NodeId, term: u64 },
}

/// Outbound path for election datagrams; a trait so tests can capture sends
#[async_trait::async_trait]
pub trait GossipSender: Send + Sync {
    async fn send_to(&self, target: &NodeId, msg: Gossip) -> Result<()>;
}

/// Election timing knobs
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a peer may be silent before it is considered dead
    pub peer_timeout: Duration,
    /// Candidate wait for ELECTION_OK
    pub election_timeout: Duration,
    /// Follower wait for COORDINATOR after deferring
    pub coordinator_wait: Duration,
    /// Grace period after boot before the first election
    pub bootstrap_grace: Duration,
}

/// What the state machine is currently waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Boot grace: no leader yet, give one time to announce itself
    Bootstrap,
    /// We are a candidate; deadline ends the round in our favor
    ElectionRound,
    /// We deferred to a higher node; deadline restarts the election
    CoordinatorWait,
    /// Steady state: periodically re-check the leader's liveness
    LeaderCheck,
}

/// Bully election state machine
pub struct ElectionManager {
    self_id: NodeId,
    config: ElectionConfig,
    membership: Arc<Membership>,
    sender: Arc<dyn GossipSender>,
    view_tx: watch::Sender<ElectionView>,

    role: Role,
    term: u64,
    leader_id: Option<NodeId>,
    pending: Pending,
    deadline: Instant,
    /// Next ELECTION resend while candidate, with doubling backoff
    resend_at: Option<Instant>,
    resend_backoff: Duration,
}

impl ElectionManager {
    pub fn new(
        self_id: NodeId,
        config: ElectionConfig,
        membership: Arc<Membership>,
        sender: Arc<dyn GossipSender>,
    ) -> (Self, watch::Receiver<ElectionView>) {
        let initial = ElectionView {
            role: Role::Follower,
            term: 0,
            leader_id: None,
        };
        let (view_tx, view_rx) = watch::channel(initial);
        let deadline = Instant::now() + config.bootstrap_grace;

        let manager = Self {
            self_id,
            config,
            membership,
            sender,
            view_tx,
            role: Role::Follower,
            term: 0,
            leader_id: None,
            pending: Pending::Bootstrap,
            deadline,
            resend_at: None,
            resend_backoff: Duration::from_millis(100),
        };
        (manager, view_rx)
    }

    /// Run the state machine until cancelled
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ElectionEvent>,
        shutdown: CancellationToken,
    ) {
        let mut snapshots = self.membership.subscribe_raw();

        loop {
            let next_timer = match self.resend_at {
                Some(resend) if resend < self.deadline => resend,
                _ => self.deadline,
            };

            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ElectionEvent::Datagram(msg)) => self.handle_gossip(msg).await,
                        Some(ElectionEvent::LeaderHint { leader_id, term }) => {
                            self.handle_leader_hint(leader_id, term).await;
                        }
                        None => break,
                    }
                }
                snapshot = snapshots.recv() => {
                    if let Ok(snapshot) = snapshot {
                        self.handle_membership(&snapshot.offline_ids()).await;
                    }
                    // Lagged receivers just pick up from the next snapshot
                }
                _ = tokio::time::sleep_until(next_timer) => {
                    self.handle_timer().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::debug!("election task stopped");
    }

    /// Current view, mainly for tests
    pub fn view(&self) -> ElectionView {
        ElectionView {
            role: self.role,
            term: self.term,
            leader_id: self.leader_id.clone(),
        }
    }

    /// Handle an incoming election datagram
    pub async fn handle_gossip(&mut self, msg: Gossip) {
        match msg {
            Gossip::Election { sender_id, term } => {
                if sender_id == self.self_id {
                    return;
                }
                // An ELECTION only counts when its term is fresher than ours;
                // the datagram transport duplicates and reorders, so stale
                // rounds must not shake a stable node
                if term <= self.term {
                    tracing::debug!(
                        from = %sender_id,
                        term,
                        our_term = self.term,
                        "ignoring stale election round"
                    );
                    return;
                }

                if sender_id > self.self_id {
                    // A higher node asking for votes means it believes the
                    // leader is gone; adopt the fresher term and wait for
                    // its COORDINATOR broadcast
                    self.term = term;
                    self.defer();
                    return;
                }

                // Fresher round from a node we outrank: adopt the term and
                // tell the sender to stand down
                self.term = term;
                let reply = Gossip::ElectionOk {
                    sender_id: self.self_id.clone(),
                    term,
                };
                self.send(&sender_id, reply).await;

                match self.role {
                    Role::Coordinator => {
                        // Assert authority at the adopted term instead of
                        // starting a new round
                        let assert = Gossip::Coordinator {
                            sender_id: self.self_id.clone(),
                            term: self.term,
                        };
                        self.send(&sender_id, assert).await;
                        self.publish();
                    }
                    Role::Candidate => {
                        // Already contesting; the claim at round end carries
                        // the adopted term
                        self.publish();
                    }
                    Role::Follower => {
                        self.start_election().await;
                    }
                }
            }
            Gossip::ElectionOk { sender_id, term } => {
                if self.role == Role::Candidate && sender_id > self.self_id {
                    tracing::info!(
                        from = %sender_id,
                        term,
                        "deferring election to higher node"
                    );
                    if term > self.term {
                        self.term = term;
                    }
                    self.defer();
                }
            }
            Gossip::Coordinator { sender_id, term } => {
                self.handle_coordinator_claim(sender_id, term).await;
            }
            Gossip::Ping { .. } | Gossip::Pong { .. } => {
                // Liveness handled by membership; nothing election-specific
            }
        }
    }

    /// COORDINATOR(term', id') handling with the same-term tie-break: the
    /// higher node id wins and the loser demotes
    async fn handle_coordinator_claim(&mut self, sender_id: NodeId, term: u64) {
        if term < self.term {
            tracing::debug!(from = %sender_id, term, our_term = self.term, "stale coordinator claim");
            return;
        }

        if term == self.term && self.role == Role::Coordinator && sender_id < self.self_id {
            // We win the tie; re-assert
            let assert = Gossip::Coordinator {
                sender_id: self.self_id.clone(),
                term: self.term,
            };
            self.send(&sender_id, assert).await;
            return;
        }

        if self.role == Role::Coordinator {
            tracing::warn!(
                new_leader = %sender_id,
                term,
                "demoting: another coordinator announced itself"
            );
            counter!("meshsearch.election.demotions").increment(1);
        } else {
            tracing::info!(leader = %sender_id, term, "adopting coordinator");
        }

        self.term = term;
        self.leader_id = Some(sender_id);
        self.role = Role::Follower;
        self.arm_leader_check();
        self.publish();
    }

    async fn handle_leader_hint(&mut self, leader_id: NodeId, term: u64) {
        if term > self.term {
            self.handle_coordinator_claim(leader_id, term).await;
        }
    }

    /// React to peers going offline: losing the current leader starts a round
    pub async fn handle_membership(&mut self, offline: &[NodeId]) {
        if let Some(leader) = &self.leader_id {
            if self.role != Role::Coordinator && offline.contains(leader) {
                tracing::warn!(leader = %leader, "leader went offline, starting election");
                self.leader_id = None;
                self.publish();
                self.start_election().await;
            }
        }
    }

    async fn handle_timer(&mut self) {
        let now = Instant::now();

        // Candidate resend path fires before the round deadline
        if self.role == Role::Candidate {
            if let Some(resend) = self.resend_at {
                if now >= resend && now < self.deadline {
                    self.broadcast_election().await;
                    self.resend_backoff = self.resend_backoff.saturating_mul(2);
                    self.resend_at = Some(now + self.jittered(self.resend_backoff));
                    return;
                }
            }
        }

        if now < self.deadline {
            return;
        }

        match self.pending {
            Pending::Bootstrap => {
                if self.leader_id.is_none() {
                    tracing::info!("no leader announced during bootstrap, starting election");
                    self.start_election().await;
                } else {
                    self.arm_leader_check();
                }
            }
            Pending::ElectionRound => {
                if self.role == Role::Candidate {
                    // No higher node objected within the window
                    self.become_coordinator().await;
                }
            }
            Pending::CoordinatorWait => {
                if self.role == Role::Follower && self.leader_id.is_none() {
                    tracing::info!("coordinator announcement never arrived, retrying election");
                    self.start_election().await;
                } else {
                    self.arm_leader_check();
                }
            }
            Pending::LeaderCheck => {
                // Backstop behind the membership-snapshot path
                let leader_gone = match &self.leader_id {
                    Some(leader) => self
                        .membership
                        .get(leader)
                        .await
                        .map(|r| !r.is_online())
                        .unwrap_or(true),
                    None => self.role != Role::Coordinator,
                };
                if leader_gone {
                    self.leader_id = None;
                    self.publish();
                    self.start_election().await;
                } else {
                    self.arm_leader_check();
                }
            }
        }
    }

    /// Begin an election round: bump the term and challenge every higher node
    pub async fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.pending = Pending::ElectionRound;
        self.deadline = Instant::now() + self.config.election_timeout;
        self.resend_backoff = Duration::from_millis(100);
        self.resend_at = Some(Instant::now() + self.jittered(self.resend_backoff));

        counter!("meshsearch.election.rounds").increment(1);
        tracing::info!(term = self.term, "starting election");
        self.publish();

        let higher = self.higher_peers().await;
        if higher.is_empty() {
            // Highest id in the cluster wins immediately
            self.become_coordinator().await;
            return;
        }
        self.broadcast_election().await;
    }

    async fn broadcast_election(&mut self) {
        let msg = Gossip::Election {
            sender_id: self.self_id.clone(),
            term: self.term,
        };
        for peer in self.higher_peers().await {
            self.send(&peer, msg.clone()).await;
        }
    }

    async fn become_coordinator(&mut self) {
        self.role = Role::Coordinator;
        self.leader_id = Some(self.self_id.clone());
        self.arm_leader_check();

        counter!("meshsearch.election.wins").increment(1);
        tracing::info!(term = self.term, "won election, assuming coordinator role");

        let msg = Gossip::Coordinator {
            sender_id: self.self_id.clone(),
            term: self.term,
        };
        for peer in self.all_other_peers().await {
            self.send(&peer, msg.clone()).await;
        }

        self.publish();
    }

    /// Stand down and wait for the higher node's COORDINATOR broadcast
    fn defer(&mut self) {
        self.role = Role::Follower;
        self.pending = Pending::CoordinatorWait;
        self.deadline = Instant::now() + self.config.coordinator_wait;
        self.resend_at = None;
        self.publish();
    }

    fn arm_leader_check(&mut self) {
        self.pending = Pending::LeaderCheck;
        self.deadline = Instant::now() + self.config.peer_timeout;
        self.resend_at = None;
    }

    fn publish(&self) {
        let _ = self.view_tx.send(self.view());
    }

    async fn higher_peers(&self) -> Vec<NodeId> {
        self.membership
            .all_peers()
            .await
            .into_iter()
            .map(|p| p.identity.node_id)
            .filter(|id| id > &self.self_id)
            .collect()
    }

    async fn all_other_peers(&self) -> Vec<NodeId> {
        self.membership
            .all_peers()
            .await
            .into_iter()
            .map(|p| p.identity.node_id)
            .filter(|id| id != &self.self_id)
            .collect()
    }

    async fn send(&self, target: &NodeId, msg: Gossip) {
        if let Err(e) = self.sender.send_to(target, msg).await {
            tracing::debug!(peer = %target, "election send failed: {}", e);
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
        base + Duration::from_millis(jitter / 2)
    }
}
