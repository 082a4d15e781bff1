//! Cluster State Module
//!
//! Membership tracking, leader election, and freshness labeling.

pub mod election;
pub mod freshness;
pub mod membership;

pub use election::{
    ElectionConfig, ElectionEvent, ElectionManager, ElectionView, GossipSender, Role,
};
pub use freshness::{AvailabilityMode, Freshness, FreshnessTracker};
pub use membership::{
    Membership, MembershipSnapshot, NodeIdentity, PeerRecord, PeerStatus,
};
