//! SQLite-backed Local Store
//!
//! Documents are durable in SQLite (content LZ4-compressed at rest) and
//! searched through an in-memory inverted index that is rebuilt from the
//! table on open. TF-IDF scoring, stable tie-breaks on doc_id.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};

use super::{IndexOutcome, SearchHit, SearchProvider, StoreStats, StoredDocument};
use crate::error::{Error, Result};
use crate::fingerprint::{self, Fingerprint};

/// Characters of context on each side of the first query match
const SNIPPET_RADIUS: usize = 80;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    doc_id TEXT PRIMARY KEY,
    content BLOB NOT NULL,
    metadata TEXT,
    fingerprint BLOB NOT NULL,
    fingerprint_hash INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// In-memory inverted index state
#[derive(Default)]
struct IndexInner {
    /// term -> doc_id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    /// doc_id -> token count
    doc_len: HashMap<String, u32>,
    /// XOR fold of all held content hashes
    digest: u64,
}

impl IndexInner {
    fn add_doc(&mut self, doc_id: &str, tokens: &[String], hash: u64) {
        for token in tokens {
            *self
                .postings
                .entry(token.clone())
                .or_default()
                .entry(doc_id.to_string())
                .or_insert(0) += 1;
        }
        self.doc_len.insert(doc_id.to_string(), tokens.len() as u32);
        self.digest ^= hash;
    }

    fn remove_doc(&mut self, doc_id: &str, tokens: &[String], hash: u64) {
        for token in tokens {
            if let Some(docs) = self.postings.get_mut(token) {
                docs.remove(doc_id);
                if docs.is_empty() {
                    self.postings.remove(token);
                }
            }
        }
        self.doc_len.remove(doc_id);
        self.digest ^= hash;
    }
}

/// SQLite-backed search provider
pub struct LocalStore {
    conn: Mutex<Connection>,
    index: RwLock<IndexInner>,
}

impl LocalStore {
    /// Create or open the store and rebuild the inverted index
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        let mut index = IndexInner::default();
        {
            let mut stmt =
                conn.prepare("SELECT doc_id, content, fingerprint_hash FROM documents")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (doc_id, blob, hash) = row?;
                let content = decompress_content(&blob)?;
                let tokens = fingerprint::tokenize(&content);
                index.add_doc(&doc_id, &tokens, hash as u64);
            }
        }

        tracing::info!(
            docs = index.doc_len.len(),
            terms = index.postings.len(),
            "local store opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            index: RwLock::new(index),
        })
    }

    /// In-memory store for tests and ephemeral nodes
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            index: RwLock::new(IndexInner::default()),
        })
    }
}

#[async_trait]
impl SearchProvider for LocalStore {
    async fn index(&self, doc: StoredDocument) -> Result<IndexOutcome> {
        let start = std::time::Instant::now();
        let tokens = fingerprint::tokenize(&doc.content);

        {
            let conn = self.conn.lock().await;

            let existing: Option<i64> = conn
                .query_row(
                    "SELECT fingerprint_hash FROM documents WHERE doc_id = ?1",
                    params![doc.doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(IndexOutcome::Duplicate);
            }

            let blob = lz4_flex::compress_prepend_size(doc.content.as_bytes());
            let fp_blob = bincode::serialize(&doc.fingerprint)?;
            let metadata = doc
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m))
                .transpose()
                .map_err(|e| Error::Internal(format!("metadata encode: {}", e)))?;

            conn.execute(
                r#"
                INSERT INTO documents
                    (doc_id, content, metadata, fingerprint, fingerprint_hash, size_bytes, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    doc.doc_id,
                    blob,
                    metadata,
                    fp_blob,
                    doc.fingerprint_hash as i64,
                    doc.size_bytes as i64,
                    doc.created_at.to_rfc3339(),
                ],
            )?;
        }

        let mut index = self.index.write().await;
        index.add_doc(&doc.doc_id, &tokens, doc.fingerprint_hash);

        counter!("meshsearch.store.indexed").increment(1);
        histogram!("meshsearch.store.index.duration").record(start.elapsed().as_secs_f64());
        Ok(IndexOutcome::Indexed)
    }

    async fn remove(&self, doc_id: &str) -> Result<bool> {
        let removed = {
            let conn = self.conn.lock().await;
            let row: Option<(Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT content, fingerprint_hash FROM documents WHERE doc_id = ?1",
                    params![doc_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((blob, hash)) => {
                    conn.execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])?;
                    let content = decompress_content(&blob)?;
                    Some((fingerprint::tokenize(&content), hash as u64))
                }
                None => None,
            }
        };

        match removed {
            Some((tokens, hash)) => {
                let mut index = self.index.write().await;
                index.remove_doc(doc_id, &tokens, hash);
                counter!("meshsearch.store.removed").increment(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let start = std::time::Instant::now();
        let terms = fingerprint::tokenize(query);
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut scores: HashMap<String, f32> = HashMap::new();
        {
            let index = self.index.read().await;
            let total_docs = index.doc_len.len() as f32;
            if total_docs == 0.0 {
                return Ok(Vec::new());
            }

            for term in &terms {
                if let Some(docs) = index.postings.get(term) {
                    let idf = (1.0 + total_docs / (1.0 + docs.len() as f32)).ln();
                    for (doc_id, tf) in docs {
                        let len = index.doc_len.get(doc_id).copied().unwrap_or(1).max(1) as f32;
                        *scores.entry(doc_id.clone()).or_insert(0.0) +=
                            (*tf as f32) * idf / len.sqrt();
                    }
                }
            }
        }

        let mut ranked: Vec<(String, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);

        let mut hits = Vec::with_capacity(ranked.len());
        {
            let conn = self.conn.lock().await;
            for (doc_id, score) in ranked {
                let blob: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT content FROM documents WHERE doc_id = ?1",
                        params![doc_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let snippet = match blob {
                    Some(blob) => make_snippet(&decompress_content(&blob)?, &terms),
                    None => String::new(),
                };
                hits.push(SearchHit {
                    doc_id,
                    score,
                    snippet,
                });
            }
        }

        counter!("meshsearch.store.searches").increment(1);
        histogram!("meshsearch.store.search.duration").record(start.elapsed().as_secs_f64());
        Ok(hits)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let index = self.index.read().await;
        Ok(StoreStats {
            doc_count: index.doc_len.len() as u64,
            term_count: index.postings.len() as u64,
        })
    }

    async fn fetch(&self, doc_id: &str) -> Result<Option<StoredDocument>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"
                SELECT content, metadata, fingerprint, fingerprint_hash, size_bytes, created_at
                FROM documents WHERE doc_id = ?1
                "#,
                params![doc_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((blob, metadata, fp_blob, hash, size, created_at)) = row else {
            return Ok(None);
        };

        let content = decompress_content(&blob)?;
        let metadata = metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| Error::Internal(format!("metadata decode: {}", e)))?;
        let fingerprint: Fingerprint = bincode::deserialize(&fp_blob)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Internal(format!("created_at decode: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(StoredDocument {
            doc_id: doc_id.to_string(),
            content,
            metadata,
            fingerprint,
            fingerprint_hash: hash as u64,
            size_bytes: size as u64,
            created_at,
        }))
    }

    async fn fingerprint_hash(&self, doc_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        let hash: Option<i64> = conn
            .query_row(
                "SELECT fingerprint_hash FROM documents WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash.map(|h| h as u64))
    }

    async fn digest(&self) -> Result<HashMap<String, u64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc_id, fingerprint_hash FROM documents")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut digest = HashMap::new();
        for row in rows {
            let (doc_id, hash) = row?;
            digest.insert(doc_id, hash as u64);
        }
        Ok(digest)
    }

    async fn digest_fold(&self) -> Result<u64> {
        Ok(self.index.read().await.digest)
    }
}

fn decompress_content(blob: &[u8]) -> Result<String> {
    let bytes = lz4_flex::decompress_size_prepended(blob)
        .map_err(|e| Error::Internal(format!("content decompress: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::Internal(format!("content not utf-8: {}", e)))
}

/// Extract a short window of content around the first query term match
fn make_snippet(content: &str, terms: &[String]) -> String {
    let lower = content.to_lowercase();
    let pos = terms.iter().filter_map(|t| lower.find(t.as_str())).min();

    // Lowercasing can shift byte offsets for non-ASCII text; fall back to a
    // head snippet when the match offset does not line up
    let pos = pos.filter(|p| content.is_char_boundary(*p));
    let Some(pos) = pos else {
        return content.chars().take(SNIPPET_RADIUS * 2).collect();
    };

    let start = content[..pos]
        .char_indices()
        .rev()
        .take(SNIPPET_RADIUS)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(pos);
    let end = content[pos..]
        .char_indices()
        .take(SNIPPET_RADIUS)
        .last()
        .map(|(i, c)| pos + i + c.len_utf8())
        .unwrap_or(content.len());

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(&content[start..end]);
    if end < content.len() {
        snippet.push_str("...");
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{content_hash, HashingVectorizer, Vectorizer};
    use tempfile::tempdir;

    async fn doc(id: &str, content: &str) -> StoredDocument {
        let fingerprint = HashingVectorizer.embed(content).await.unwrap();
        StoredDocument {
            doc_id: id.to_string(),
            content: content.to_string(),
            metadata: None,
            fingerprint,
            fingerprint_hash: content_hash(content),
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_index_and_search() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .index(doc("d1", "python is a programming language").await)
            .await
            .unwrap();
        store
            .index(doc("d2", "rust is a systems programming language").await)
            .await
            .unwrap();

        let hits = store.search("python", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d1");
        assert!(hits[0].score > 0.0);
        assert!(hits[0].snippet.to_lowercase().contains("python"));

        let hits = store.search("programming", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_detection() {
        let store = LocalStore::open_in_memory().unwrap();
        let d = doc("d1", "hello world").await;
        assert_eq!(store.index(d.clone()).await.unwrap(), IndexOutcome::Indexed);
        assert_eq!(store.index(d).await.unwrap(), IndexOutcome::Duplicate);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.doc_count, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = LocalStore::open_in_memory().unwrap();
        store.index(doc("d1", "ephemeral text").await).await.unwrap();

        assert!(store.remove("d1").await.unwrap());
        assert!(!store.remove("d1").await.unwrap());
        assert!(store.search("ephemeral", 10).await.unwrap().is_empty());
        assert_eq!(store.digest_fold().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_durability_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("documents.db");

        {
            let store = LocalStore::open(&path).unwrap();
            store
                .index(doc("d1", "durable document body").await)
                .await
                .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        let hits = store.search("durable", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        let fetched = store.fetch("d1").await.unwrap().unwrap();
        assert_eq!(fetched.content, "durable document body");
        assert_eq!(fetched.fingerprint_hash, content_hash("durable document body"));
    }

    #[tokio::test]
    async fn test_score_ordering_and_tiebreak() {
        let store = LocalStore::open_in_memory().unwrap();
        // d2 mentions the term twice, d1 and d3 once with identical bodies
        store.index(doc("d3", "alpha beta").await).await.unwrap();
        store
            .index(doc("d2", "alpha alpha beta beta").await)
            .await
            .unwrap();
        store.index(doc("d1", "alpha beta").await).await.unwrap();

        let hits = store.search("alpha", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].doc_id, "d2");
        // identical scores tie-break on doc_id ascending
        assert_eq!(hits[1].doc_id, "d1");
        assert_eq!(hits[2].doc_id, "d3");
    }

    #[tokio::test]
    async fn test_digest_tracks_content() {
        let store = LocalStore::open_in_memory().unwrap();
        store.index(doc("d1", "one").await).await.unwrap();
        store.index(doc("d2", "two").await).await.unwrap();

        let digest = store.digest().await.unwrap();
        assert_eq!(digest.len(), 2);
        assert_eq!(digest["d1"], content_hash("one"));

        let fold = store.digest_fold().await.unwrap();
        assert_eq!(
            fold,
            crate::fingerprint::digest_fold([content_hash("one"), content_hash("two")])
        );
    }

    #[tokio::test]
    async fn test_empty_query_and_empty_store() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.search("anything", 5).await.unwrap().is_empty());
        store.index(doc("d1", "text").await).await.unwrap();
        assert!(store.search("", 5).await.unwrap().is_empty());
        assert!(store.search("text", 0).await.unwrap().is_empty());
    }
}
