//! Coordinator Services
//!
//! Leader-only duties: the location index, the repair/anti-entropy worker,
//! and placement snapshotting. The bundle is started when this node wins an
//! election and torn down (with a short grace) when it demotes.

pub mod placement;
pub mod replication;
pub mod router;

pub use placement::{LocationIndex, Placement, PlacementHealth, PlacementStats};
pub use replication::{
    apply_placement_update, RepairWorker, ReplicationCoordinator, ReplicationSettings,
    WriteRequest,
};
pub use router::{QueryRouter, SearchResponse, SearchResult};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// How long demotion waits for coordinator tasks to drain
const DEMOTION_GRACE: Duration = Duration::from_secs(1);

/// The running leader-only service bundle
pub struct CoordinatorServices {
    pub location: Arc<LocationIndex>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl CoordinatorServices {
    pub fn new(
        location: Arc<LocationIndex>,
        cancel: CancellationToken,
        tasks: Vec<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            location,
            cancel,
            tasks,
        }
    }
}

/// Shared slot holding the coordinator services while this node leads.
/// Components check it to decide between acting locally and dialing the
/// leader.
#[derive(Default)]
pub struct CoordinatorHandle {
    inner: RwLock<Option<CoordinatorServices>>,
}

impl CoordinatorHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The location index when this node currently leads
    pub async fn location(&self) -> Option<Arc<LocationIndex>> {
        self.inner.read().await.as_ref().map(|s| Arc::clone(&s.location))
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Install freshly started services on promotion
    pub async fn promote(&self, services: CoordinatorServices) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.take() {
            tracing::warn!("promoting with stale coordinator services still installed");
            old.cancel.cancel();
        }
        *inner = Some(services);
        tracing::info!("coordinator services started");
    }

    /// Tear the services down: cancel, wait out the grace period, and write
    /// a final placement snapshot. In-flight coordinator-only work fails
    /// with LEADER_CHANGED on the caller side.
    pub async fn demote(&self) {
        let services = {
            let mut inner = self.inner.write().await;
            inner.take()
        };
        let Some(services) = services else {
            return;
        };

        services.cancel.cancel();
        let drain = async {
            for task in services.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(DEMOTION_GRACE, drain).await.is_err() {
            tracing::warn!("coordinator tasks did not drain within grace period");
        }

        if let Err(e) = services.location.save_snapshot().await {
            tracing::warn!("final placement snapshot failed: {}", e);
        }
        tracing::info!("coordinator services stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_handle_starts_empty() {
        let handle = CoordinatorHandle::new();
        assert!(!handle.is_active().await);
        assert!(handle.location().await.is_none());
    }

    #[tokio::test]
    async fn test_promote_then_demote() {
        let dir = tempdir().unwrap();
        let handle = CoordinatorHandle::new();
        let location = Arc::new(LocationIndex::new(dir.path().to_path_buf()));
        let cancel = CancellationToken::new();

        handle
            .promote(CoordinatorServices::new(location, cancel.clone(), Vec::new()))
            .await;
        assert!(handle.is_active().await);
        assert!(handle.location().await.is_some());

        handle.demote().await;
        assert!(!handle.is_active().await);
        assert!(cancel.is_cancelled());
        // Final snapshot landed on disk
        assert!(dir.path().join("placements.snapshot").exists());
    }

    #[tokio::test]
    async fn test_demote_without_promote_is_noop() {
        let handle = CoordinatorHandle::new();
        handle.demote().await;
        assert!(!handle.is_active().await);
    }
}
