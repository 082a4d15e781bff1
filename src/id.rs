//! Document ID Generation
//!
//! A primary assigns document ids without coordinating with the rest of the
//! cluster. An id is a millisecond-scaled monotonic counter sitting above a
//! 10-bit tag folded from this node's election id: the tag keeps ids minted
//! by different nodes disjoint, the counter keeps ids from one node unique
//! and roughly creation-ordered.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fingerprint::content_hash;

/// Low bits carrying the node tag
const TAG_BITS: u64 = 10;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// One generate() advances the counter past the previous id while leaving
/// the tag bits untouched
const TICK: u64 = 1 << TAG_BITS;

/// A document id minted by this node. Ids travel as strings on the wire and
/// clients may supply their own arbitrary ids; this is only the generated
/// form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(u64);

impl DocId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The minting node's 10-bit tag
    pub fn node_tag(&self) -> u16 {
        (self.0 & TAG_MASK) as u16
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordination-free document id generator.
///
/// Each id is the maximum of the current wall-clock floor and the previous
/// id plus one tick. A burst within a single millisecond keeps counting
/// upward instead of colliding, and a clock that steps backwards leaves the
/// counter where it was until real time catches up.
pub struct DocIdGenerator {
    tag: u64,
    last: AtomicU64,
}

impl DocIdGenerator {
    /// Build a generator for this node; the election-visible node id string
    /// is folded into the tag bits
    pub fn new(node_id: &str) -> Self {
        Self {
            tag: content_hash(node_id) & TAG_MASK,
            last: AtomicU64::new(0),
        }
    }

    /// Mint the next id; lock-free and thread-safe
    pub fn generate(&self) -> DocId {
        let floor = (wall_clock_millis() << TAG_BITS) | self.tag;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = floor.max(prev.wrapping_add(TICK));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return DocId(next),
                Err(seen) => prev = seen,
            }
        }
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
