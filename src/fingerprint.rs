//! Content Fingerprints
//!
//! Fixed-dimension real-valued fingerprints with cosine similarity semantics.
//! Fingerprints rank both replica placement (document vs node affinity) and
//! query routing (query vs node affinity). The default vectorizer is a
//! deterministic feature-hashing embedder; deployments may plug in a real
//! embedding model behind the same trait.

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use crate::error::Result;

/// Fingerprint dimensionality
pub const FINGERPRINT_DIM: usize = 384;

/// A fixed-width, L2-normalized content fingerprint
pub type Fingerprint = Vec<f32>;

/// Turns text into a fingerprint. Implementations must be deterministic for
/// the same input so follower-side conflict checks agree with the primary.
#[async_trait]
pub trait Vectorizer: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Fingerprint>;
}

/// Feature-hashing vectorizer: each token is hashed into one of the
/// `FINGERPRINT_DIM` buckets with a hash-derived sign, then the vector is
/// L2-normalized. No model weights, no I/O, fully deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingVectorizer;

#[async_trait]
impl Vectorizer for HashingVectorizer {
    async fn embed(&self, text: &str) -> Result<Fingerprint> {
        let mut v = vec![0.0f32; FINGERPRINT_DIM];
        for token in tokenize(text) {
            let h = token_hash(&token);
            let bucket = (h % FINGERPRINT_DIM as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

/// Split text into lowercase alphanumeric tokens. Shared between the
/// vectorizer and the inverted index so scoring and placement agree on what
/// a term is.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Cosine similarity between two fingerprints; zero vectors score 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Normalize a vector to unit L2 length in place
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Mean of a set of fingerprints; `None` when empty
pub fn mean_fingerprint<'a, I>(fingerprints: I) -> Option<Fingerprint>
where
    I: IntoIterator<Item = &'a Fingerprint>,
{
    let mut sum = vec![0.0f32; FINGERPRINT_DIM];
    let mut count = 0usize;
    for fp in fingerprints {
        if fp.len() != FINGERPRINT_DIM {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(fp.iter()) {
            *s += x;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for s in sum.iter_mut() {
        *s /= count as f32;
    }
    Some(sum)
}

/// Content digest: first 8 bytes of the SHA-1 of the raw content.
/// Used for duplicate/conflict detection and anti-entropy digests.
pub fn content_hash(content: &str) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().expect("sha1 digest is 20 bytes"))
}

/// XOR-fold a set of content hashes into one value. Order-independent, so
/// two nodes holding the same documents produce the same fold.
pub fn digest_fold<I: IntoIterator<Item = u64>>(hashes: I) -> u64 {
    hashes.into_iter().fold(0u64, |acc, h| acc ^ h)
}

fn token_hash(token: &str) -> u64 {
    // FNV-1a, cheap and stable across platforms
    let mut hash = 0xcbf29ce484222325u64;
    for b in token.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
