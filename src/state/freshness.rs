//! Freshness Tracking
//!
//! Every search response carries a freshness tag derived from the current
//! membership snapshot and election view. The cluster keeps answering under
//! partition (AP); the tag is the honest part of the contract.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::membership::MembershipSnapshot;
use crate::transport::protocol::NodeId;

/// Confidence that a response reflects the latest global state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Freshness {
    Confirmed,
    LikelyCurrent,
    PotentiallyStale,
    Stale,
}

/// Whether the candidate set came through the coordinator or the AP fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityMode {
    CpLike,
    Ap,
}

/// Per-response freshness computation
pub struct FreshnessTracker {
    cluster_size: usize,
}

impl FreshnessTracker {
    pub fn new(cluster_size: usize) -> Self {
        Self { cluster_size }
    }

    fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    /// Compute the tag and optional staleness warning for one response.
    ///
    /// `unavailable` is the set of candidates that failed during this
    /// query's fan-out; `degraded_for` is how long the node has been below
    /// majority, when it is.
    pub fn label(
        &self,
        snapshot: &MembershipSnapshot,
        leader_known: bool,
        unavailable: &[NodeId],
        degraded_for: Option<Duration>,
    ) -> (Freshness, Option<String>) {
        let online = snapshot.online_count();
        let offline = snapshot.offline_ids();

        // Partition detection: fewer live nodes than half the configured
        // cluster, or no leader at all
        if !leader_known || online < self.cluster_size / 2 {
            return (
                Freshness::Stale,
                Some(self.warning(&offline, unavailable, degraded_for)),
            );
        }

        if online < self.majority() {
            return (
                Freshness::PotentiallyStale,
                Some(self.warning(&offline, unavailable, degraded_for)),
            );
        }

        if !offline.is_empty() || !unavailable.is_empty() {
            return (Freshness::LikelyCurrent, None);
        }

        (Freshness::Confirmed, None)
    }

    fn warning(
        &self,
        offline: &[NodeId],
        unavailable: &[NodeId],
        degraded_for: Option<Duration>,
    ) -> String {
        let mut unreachable: Vec<&str> = offline
            .iter()
            .chain(unavailable.iter())
            .map(|s| s.as_str())
            .collect();
        unreachable.sort_unstable();
        unreachable.dedup();

        let age = degraded_for
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "unknown".to_string());

        format!(
            "results may be stale: unreachable nodes [{}], partition age {}",
            unreachable.join(", "),
            age
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::membership::{NodeIdentity, PeerRecord, PeerStatus};

    fn snapshot(online: &[&str], offline: &[&str]) -> MembershipSnapshot {
        let mut peers = Vec::new();
        for (ids, status) in [(online, PeerStatus::Online), (offline, PeerStatus::Offline)] {
            for id in ids.iter() {
                peers.push(PeerRecord {
                    identity: NodeIdentity {
                        node_id: id.to_string(),
                        rpc_addr: String::new(),
                        heartbeat_addr: String::new(),
                    },
                    status,
                    last_heartbeat: None,
                    last_monotonic_ts: 0,
                    doc_count: 0,
                    term_count: 0,
                    load_score: 0.0,
                    zone: None,
                    doc_digest: 0,
                });
            }
        }
        MembershipSnapshot {
            generation: 1,
            peers,
        }
    }

    #[test]
    fn test_confirmed_when_everything_is_up() {
        let tracker = FreshnessTracker::new(3);
        let snap = snapshot(&["a", "b", "c"], &[]);
        let (tag, warning) = tracker.label(&snap, true, &[], None);
        assert_eq!(tag, Freshness::Confirmed);
        assert!(warning.is_none());
    }

    #[test]
    fn test_likely_current_with_one_node_down() {
        let tracker = FreshnessTracker::new(3);
        let snap = snapshot(&["a", "b"], &["c"]);
        let (tag, _) = tracker.label(&snap, true, &[], None);
        assert_eq!(tag, Freshness::LikelyCurrent);
    }

    #[test]
    fn test_likely_current_with_failed_candidate() {
        let tracker = FreshnessTracker::new(3);
        let snap = snapshot(&["a", "b", "c"], &[]);
        let (tag, _) = tracker.label(&snap, true, &["b".to_string()], None);
        assert_eq!(tag, Freshness::LikelyCurrent);
    }

    #[test]
    fn test_stale_without_leader() {
        let tracker = FreshnessTracker::new(3);
        let snap = snapshot(&["a", "b", "c"], &[]);
        let (tag, warning) = tracker.label(&snap, false, &[], None);
        assert_eq!(tag, Freshness::Stale);
        assert!(warning.is_some());
    }

    #[test]
    fn test_minority_partition_of_five() {
        // Cluster of 5 partitioned {a,b} | {c,d,e}; the minority side has a
        // leader of its own (bully elects in any partition)
        let tracker = FreshnessTracker::new(5);
        let snap = snapshot(&["a", "b"], &["c", "d", "e"]);
        let (tag, warning) = tracker.label(
            &snap,
            true,
            &[],
            Some(Duration::from_secs(12)),
        );
        assert_eq!(tag, Freshness::PotentiallyStale);
        let warning = warning.unwrap();
        assert!(warning.contains("c"));
        assert!(warning.contains("d"));
        assert!(warning.contains("e"));
        assert!(warning.contains("12s"));
    }

    #[test]
    fn test_majority_partition_of_five() {
        let tracker = FreshnessTracker::new(5);
        let snap = snapshot(&["c", "d", "e"], &["a", "b"]);
        let (tag, _) = tracker.label(&snap, true, &[], None);
        assert_eq!(tag, Freshness::LikelyCurrent);
    }

    #[test]
    fn test_tiny_partition_is_stale() {
        let tracker = FreshnessTracker::new(5);
        let snap = snapshot(&["a"], &["b", "c", "d", "e"]);
        let (tag, _) = tracker.label(&snap, true, &[], None);
        assert_eq!(tag, Freshness::Stale);
    }

    #[test]
    fn test_serialized_tag_tokens() {
        assert_eq!(
            serde_json::to_string(&Freshness::PotentiallyStale).unwrap(),
            "\"POTENTIALLY_STALE\""
        );
        assert_eq!(
            serde_json::to_string(&AvailabilityMode::CpLike).unwrap(),
            "\"CP_LIKE\""
        );
        assert_eq!(serde_json::to_string(&AvailabilityMode::Ap).unwrap(), "\"AP\"");
    }
}
