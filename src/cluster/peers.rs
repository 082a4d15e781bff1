//! Peer RPC Seam
//!
//! Narrow trait over the peer RPC surface so the replication coordinator and
//! query router can be driven against in-memory fakes in tests. The
//! production implementation resolves peer addresses through membership and
//! rides the pooled RPC client.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::state::{ElectionEvent, Membership};
use crate::store::{SearchHit, StoredDocument};
use crate::transport::protocol::{NodeId, PlacementUpdate, RpcBody, RpcOutcome, RpcReply};
use crate::transport::RpcClient;

/// Typed view of the peer RPC surface
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn search_local(
        &self,
        peer: &NodeId,
        query: &str,
        k: usize,
        deadline: Duration,
    ) -> Result<Vec<SearchHit>>;

    /// Ok means the peer acked the replica; a CONFLICT nack surfaces as
    /// `Error::Conflict`
    async fn replicate_doc(
        &self,
        peer: &NodeId,
        doc: &StoredDocument,
        deadline: Duration,
    ) -> Result<()>;

    async fn rollback_doc(&self, peer: &NodeId, doc_id: &str, deadline: Duration) -> Result<()>;

    async fn locate_query(
        &self,
        peer: &NodeId,
        fingerprint: &Fingerprint,
        max_candidates: usize,
        exclude: &[NodeId],
        spread_zones: bool,
        deadline: Duration,
    ) -> Result<Vec<NodeId>>;

    async fn placement_update(
        &self,
        peer: &NodeId,
        update: PlacementUpdate,
        deadline: Duration,
    ) -> Result<()>;

    async fn digest_request(
        &self,
        peer: &NodeId,
        deadline: Duration,
    ) -> Result<HashMap<String, u64>>;

    async fn fetch_doc(
        &self,
        peer: &NodeId,
        doc_id: &str,
        deadline: Duration,
    ) -> Result<StoredDocument>;
}

/// Production implementation over the pooled RPC client
pub struct RpcPeerClient {
    client: RpcClient,
    membership: Arc<Membership>,
    /// Leader/term hints from RPC replies feed the election task
    election_events: mpsc::Sender<ElectionEvent>,
}

impl RpcPeerClient {
    pub fn new(
        client: RpcClient,
        membership: Arc<Membership>,
        election_events: mpsc::Sender<ElectionEvent>,
    ) -> Self {
        Self {
            client,
            membership,
            election_events,
        }
    }

    async fn call(&self, peer: &NodeId, body: RpcBody, deadline: Duration) -> Result<RpcReply> {
        let address = self
            .membership
            .rpc_addr(peer)
            .await
            .ok_or_else(|| Error::UnknownPeer(peer.clone()))?;

        let reply = self.client.call(&address, body, deadline).await?;

        // Every reply carries the server's believed leader; refresh our cache
        if let Some(leader_id) = reply.leader_id.clone() {
            let _ = self.election_events.try_send(ElectionEvent::LeaderHint {
                leader_id,
                term: reply.term,
            });
        }

        Ok(reply)
    }
}

fn unexpected(peer: &NodeId, outcome: &RpcOutcome) -> Error {
    match outcome {
        RpcOutcome::Error { kind, message } => Error::from_remote(kind, message),
        other => Error::Network(format!(
            "unexpected rpc outcome from {}: {:?}",
            peer,
            std::mem::discriminant(other)
        )),
    }
}

#[async_trait]
impl PeerClient for RpcPeerClient {
    async fn search_local(
        &self,
        peer: &NodeId,
        query: &str,
        k: usize,
        deadline: Duration,
    ) -> Result<Vec<SearchHit>> {
        let body = RpcBody::SearchLocal {
            query: query.to_string(),
            k,
        };
        let reply = self.call(peer, body, deadline).await?;
        match reply.body {
            RpcOutcome::Hits(hits) => Ok(hits),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn replicate_doc(
        &self,
        peer: &NodeId,
        doc: &StoredDocument,
        deadline: Duration,
    ) -> Result<()> {
        let body = RpcBody::ReplicateDoc {
            doc: doc.clone(),
            origin: self.membership.self_id().to_string(),
        };
        let reply = self.call(peer, body, deadline).await?;
        match reply.body {
            RpcOutcome::Ack => Ok(()),
            RpcOutcome::Nack { reason } => {
                tracing::debug!(peer = %peer, doc_id = %doc.doc_id, "replica nack: {}", reason);
                Err(Error::Conflict {
                    doc_id: doc.doc_id.clone(),
                })
            }
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn rollback_doc(&self, peer: &NodeId, doc_id: &str, deadline: Duration) -> Result<()> {
        let body = RpcBody::RollbackDoc {
            doc_id: doc_id.to_string(),
        };
        let reply = self.call(peer, body, deadline).await?;
        match reply.body {
            RpcOutcome::Ok => Ok(()),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn locate_query(
        &self,
        peer: &NodeId,
        fingerprint: &Fingerprint,
        max_candidates: usize,
        exclude: &[NodeId],
        spread_zones: bool,
        deadline: Duration,
    ) -> Result<Vec<NodeId>> {
        let body = RpcBody::LocateQuery {
            fingerprint: fingerprint.clone(),
            max_candidates,
            exclude: exclude.to_vec(),
            spread_zones,
        };
        let reply = self.call(peer, body, deadline).await?;
        match reply.body {
            RpcOutcome::Candidates(candidates) => Ok(candidates),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn placement_update(
        &self,
        peer: &NodeId,
        update: PlacementUpdate,
        deadline: Duration,
    ) -> Result<()> {
        let reply = self
            .call(peer, RpcBody::PlacementUpdate(update), deadline)
            .await?;
        match reply.body {
            RpcOutcome::Ok => Ok(()),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn digest_request(
        &self,
        peer: &NodeId,
        deadline: Duration,
    ) -> Result<HashMap<String, u64>> {
        let reply = self.call(peer, RpcBody::DigestRequest, deadline).await?;
        match reply.body {
            RpcOutcome::Digest(digest) => Ok(digest),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn fetch_doc(
        &self,
        peer: &NodeId,
        doc_id: &str,
        deadline: Duration,
    ) -> Result<StoredDocument> {
        let body = RpcBody::FetchDoc {
            doc_id: doc_id.to_string(),
        };
        let reply = self.call(peer, body, deadline).await?;
        match reply.body {
            RpcOutcome::Document(doc) => Ok(doc),
            other => Err(unexpected(peer, &other)),
        }
    }
}
