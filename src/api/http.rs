//! HTTP API Server
//!
//! REST surface for document writes, distributed search, node status, and
//! Prometheus metrics. The handlers are thin shells: they marshal requests
//! into the replication coordinator and query router and map error kinds to
//! status codes.

use std::collections::HashSet;
use std::sync::Arc;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::Node;
use crate::coordinator::{PlacementStats, WriteRequest};
use crate::error::{Error, Result};
use crate::metrics as node_metrics;
use crate::state::PeerStatus;
use crate::store::StoreStats;
use crate::transport::protocol::NodeId;

/// Shared handler state
pub struct AppState {
    node: Arc<Node>,
}

/// HTTP API server
pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            state: Arc::new(AppState { node }),
        }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        let cors_enabled = state.node.config().api.cors_enabled;
        let mut router = Router::new()
            .route("/doc", post(handle_put_doc))
            .route("/search", get(handle_search))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .layer(TraceLayer::new_for_http());
        if cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router.with_state(state)
    }

    /// Serve until the shutdown token fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let bind = self.state.node.config().api.bind_http.clone();
        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&bind).await?;
        tracing::info!("http api listening on {}", bind);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("http server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Deserialize)]
pub struct PutDocRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub doc_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PutDocResponse {
    pub doc_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub max: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub role: String,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub cluster_size: usize,
    pub online_nodes: usize,
    pub store: StoreStats,
    pub peers: Vec<PeerView>,
    /// Present only on the coordinator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placements: Option<PlacementsView>,
}

#[derive(Debug, Serialize)]
pub struct PeerView {
    pub node_id: String,
    pub status: String,
    pub age_ms: Option<u64>,
    pub doc_count: u64,
    pub term_count: u64,
    pub load_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlacementsView {
    pub stats: PlacementStats,
    pub entries: Vec<PlacementView>,
}

#[derive(Debug, Serialize)]
pub struct PlacementView {
    pub doc_id: String,
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
    pub health: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_put_doc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PutDocRequest>,
) -> impl IntoResponse {
    let write = WriteRequest {
        doc_id: request.doc_id,
        content: request.content,
        metadata: request.metadata,
    };

    match state.node.replication().write(write).await {
        Ok(doc_id) => (StatusCode::OK, Json(PutDocResponse { doc_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let max = params.max.unwrap_or(10).clamp(1, 1000);
    match state.node.router().search(&params.q, max).await {
        // Degraded answers are still 200; the freshness tag is the contract
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    let view = node.election_view();
    let peers = node.membership().all_peers().await;
    let online: HashSet<NodeId> = peers
        .iter()
        .filter(|p| p.status == PeerStatus::Online)
        .map(|p| p.identity.node_id.clone())
        .collect();

    let placements = match node.coordinator().location().await {
        Some(location) => {
            let stats = location.stats(&online).await;
            let entries = location
                .all()
                .await
                .into_iter()
                .map(|p| PlacementView {
                    health: format!("{:?}", p.health(&online)),
                    doc_id: p.doc_id,
                    primary: p.primary,
                    replicas: p.replicas.into_iter().collect(),
                })
                .collect();
            Some(PlacementsView { stats, entries })
        }
        None => None,
    };

    let store = node.store().stats().await.unwrap_or_default();

    let response = StatusResponse {
        node_id: node.config().node.id.clone(),
        role: view.role.to_string(),
        term: view.term,
        leader_id: view.leader_id,
        cluster_size: node.config().cluster_size(),
        online_nodes: online.len(),
        store,
        peers: peers
            .into_iter()
            .map(|p| PeerView {
                age_ms: p.age().map(|d| d.as_millis() as u64),
                node_id: p.identity.node_id,
                status: p.status.to_string(),
                doc_count: p.doc_count,
                term_count: p.term_count,
                load_score: p.load_score,
                zone: p.zone,
            })
            .collect(),
        placements,
    };

    Json(response)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.node.election_view();
    Json(HealthResponse {
        healthy: true,
        node_id: state.node.config().node.id.clone(),
        role: view.role.to_string(),
    })
}

async fn handle_metrics() -> impl IntoResponse {
    match node_metrics::prometheus_handle() {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed\n".to_string(),
        )
            .into_response(),
    }
}

/// Map an error kind to its HTTP status; the stable token rides the body
fn error_response(e: Error) -> axum::response::Response {
    let code = e.kind();
    let status = match code {
        "CONFLICT" => StatusCode::CONFLICT,
        "WRITE_QUORUM_FAILED" | "LEADER_CHANGED" | "TRANSIENT_PEER" | "PEER_BUSY" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::debug!(code, "request failed: {}", e);
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let resp = error_response(Error::Conflict { doc_id: "d".into() });
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = error_response(Error::QuorumFailed { acks: 1, required: 2 });
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = error_response(Error::NoLeader);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = error_response(Error::Internal("bad".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_search_params_parse() {
        let params: SearchParams = serde_json::from_str(r#"{"q": "python"}"#).unwrap();
        assert_eq!(params.q, "python");
        assert!(params.max.is_none());
    }
}
