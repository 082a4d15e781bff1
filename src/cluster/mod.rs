//! Cluster Module
//!
//! Node bootstrap/shutdown and the typed peer RPC seam.

mod node;
mod peers;

pub use node::Node;
pub use peers::{PeerClient, RpcPeerClient};
