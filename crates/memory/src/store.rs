//! Vector-store collaborator boundary.
//!
//! The subsystem consumes an opaque embed/upsert/query/get/delete capability
//! over named collections.  [`VectorStore`] is that seam; [`InMemoryStore`]
//! is the reference implementation used by tests and small deployments.
//! Approximate-nearest-neighbour indexing belongs to the external
//! collaborator and is deliberately not implemented here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;

/// Maps a text string to an embedding vector.  Stored as an `Arc` so it can
/// be cloned across structs.
pub type EmbedderFn = Arc<dyn Fn(&str) -> Vec<f32> + Send + Sync>;

/// Exact-match metadata filter: every key must equal the stored value.
pub type MetadataFilter = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Query text, embedded by the store when `vector` is absent.
    pub text: Option<String>,
    /// Pre-computed query embedding; takes precedence over `text`.
    pub vector: Option<Vec<f32>>,
    pub filter: Option<MetadataFilter>,
    /// Maximum hits returned.  `0` means unbounded.
    pub top_k: usize,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    /// Cosine-style distance in [0, 2]; see [`similarity_from_distance`].
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub id: String,
    pub text: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    /// When set, fetch exactly these ids (missing ids are silently absent
    /// from the result; the caller decides whether that is an error).
    pub ids: Option<Vec<String>>,
    pub filter: Option<MetadataFilter>,
    pub limit: Option<usize>,
}

impl GetRequest {
    pub fn by_ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn by_filter(filter: MetadataFilter) -> Self {
        Self { filter: Some(filter), ..Default::default() }
    }
}

/// The external vector-store collaborator.
///
/// Errors are collaborator-level (`anyhow`); the manager wraps them as
/// `MemoryError::BackendUnavailable` at the subsystem boundary.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        text: &str,
        metadata: Value,
    ) -> Result<()>;

    async fn query(&self, collection: &str, request: QueryRequest) -> Result<Vec<QueryHit>>;

    async fn get(&self, collection: &str, request: GetRequest) -> Result<Vec<StoredDoc>>;

    /// Replace a document's metadata in place, leaving text and vector
    /// untouched.  Access tracking and consolidation depend on this.
    async fn update_metadata(&self, collection: &str, id: &str, metadata: Value) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

/// Similarity derived from a cosine-style distance in [0, 2].
pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(-1.0, 1.0)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

// ── In-memory reference store ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredEntry {
    vector: Vec<f32>,
    text: String,
    metadata: Value,
}

type Collections = BTreeMap<String, BTreeMap<String, StoredEntry>>;

/// In-memory [`VectorStore`] with exact cosine scoring.
///
/// Collections and documents live in `BTreeMap`s so iteration order — and
/// therefore tie-breaking — is deterministic.  The embedder is pluggable;
/// the default hashes tokens into a fixed-width bag-of-words vector, which
/// is deterministic and good enough for tests and small corpora.
pub struct InMemoryStore {
    collections: Mutex<Collections>,
    embedder: EmbedderFn,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_embedder(Arc::new(|text: &str| token_embedding(text)))
    }

    pub fn with_embedder(embedder: EmbedderFn) -> Self {
        Self { collections: Mutex::new(BTreeMap::new()), embedder }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>> {
        self.collections.lock().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok((self.embedder)(text))
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        text: &str,
        metadata: Value,
    ) -> Result<()> {
        let mut collections = self.lock()?;
        collections.entry(collection.to_string()).or_default().insert(
            id.to_string(),
            StoredEntry { vector, text: text.to_string(), metadata },
        );
        Ok(())
    }

    async fn query(&self, collection: &str, request: QueryRequest) -> Result<Vec<QueryHit>> {
        let query_vector = match (request.vector, request.text.as_deref()) {
            (Some(v), _) => v,
            (None, Some(text)) => (self.embedder)(text),
            (None, None) => bail!("query needs either text or a vector"),
        };

        let collections = self.lock()?;
        let Some(entries) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<QueryHit> = entries
            .iter()
            .filter(|(_, entry)| matches_filter(&entry.metadata, request.filter.as_ref()))
            .map(|(id, entry)| QueryHit {
                id: id.clone(),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                distance: 1.0 - cosine_similarity(&entry.vector, &query_vector),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        if request.top_k > 0 {
            hits.truncate(request.top_k);
        }
        Ok(hits)
    }

    async fn get(&self, collection: &str, request: GetRequest) -> Result<Vec<StoredDoc>> {
        let collections = self.lock()?;
        let Some(entries) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut docs = Vec::new();
        match &request.ids {
            // Preserve the requested id order; absent ids simply don't appear.
            Some(ids) => {
                for id in ids {
                    if let Some(entry) = entries.get(id) {
                        if matches_filter(&entry.metadata, request.filter.as_ref()) {
                            docs.push(StoredDoc {
                                id: id.clone(),
                                text: entry.text.clone(),
                                metadata: entry.metadata.clone(),
                            });
                        }
                    }
                }
            }
            None => {
                for (id, entry) in entries {
                    if matches_filter(&entry.metadata, request.filter.as_ref()) {
                        docs.push(StoredDoc {
                            id: id.clone(),
                            text: entry.text.clone(),
                            metadata: entry.metadata.clone(),
                        });
                    }
                }
            }
        }

        if let Some(limit) = request.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn update_metadata(&self, collection: &str, id: &str, metadata: Value) -> Result<()> {
        let mut collections = self.lock()?;
        let entry = collections
            .get_mut(collection)
            .and_then(|entries| entries.get_mut(id))
            .ok_or_else(|| anyhow!("no document {id} in collection {collection}"))?;
        entry.metadata = metadata;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.lock()?;
        if let Some(entries) = collections.get_mut(collection) {
            entries.remove(id);
        }
        Ok(())
    }
}

fn matches_filter(metadata: &Value, filter: Option<&MetadataFilter>) -> bool {
    let Some(filter) = filter else { return true };
    filter.iter().all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Deterministic bag-of-words embedding: each token is FNV-hashed into one of
/// `EMBED_DIM` buckets, then the vector is L2-normalised.  Identical texts map
/// to identical vectors; texts sharing most tokens land close together.
const EMBED_DIM: usize = 64;

fn token_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBED_DIM];
    for token in text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
    {
        v[fnv1a(token.as_bytes()) as usize % EMBED_DIM] += 1.0;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn filter(key: &str, value: &str) -> MetadataFilter {
        let mut f = MetadataFilter::new();
        f.insert(key.to_string(), json!(value));
        f
    }

    async fn seed(store: &InMemoryStore, collection: &str, id: &str, text: &str, category: &str) {
        let vector = store.embed(text).await.unwrap();
        store
            .upsert(collection, id, vector, text, json!({ "category": category }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn identical_text_ranks_first_with_zero_distance() {
        let store = InMemoryStore::new();
        seed(&store, "kb", "a", "the river froze overnight", "fact").await;
        seed(&store, "kb", "b", "music drifted across the square", "fact").await;

        let hits = store
            .query("kb", QueryRequest {
                text: Some("the river froze overnight".to_string()),
                top_k: 2,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance.abs() < 1e-6);
        assert!(hits[1].distance > hits[0].distance);
    }

    #[tokio::test]
    async fn filter_restricts_results_to_matching_metadata() {
        let store = InMemoryStore::new();
        seed(&store, "kb", "a", "frost on the window", "fact").await;
        seed(&store, "kb", "b", "frost on the window", "question").await;

        let hits = store
            .query("kb", QueryRequest {
                text: Some("frost on the window".to_string()),
                filter: Some(filter("category", "question")),
                top_k: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn get_by_ids_preserves_requested_order_and_skips_missing() {
        let store = InMemoryStore::new();
        seed(&store, "kb", "a", "one", "fact").await;
        seed(&store, "kb", "b", "two", "fact").await;

        let docs = store
            .get("kb", GetRequest::by_ids(["b", "missing", "a"]))
            .await
            .unwrap();

        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn update_metadata_replaces_in_place() {
        let store = InMemoryStore::new();
        seed(&store, "kb", "a", "one", "fact").await;

        store
            .update_metadata("kb", "a", json!({ "category": "revised" }))
            .await
            .unwrap();

        let docs = store.get("kb", GetRequest::by_ids(["a"])).await.unwrap();
        assert_eq!(docs[0].metadata["category"], "revised");
    }

    #[tokio::test]
    async fn update_metadata_for_unknown_id_is_an_error() {
        let store = InMemoryStore::new();
        assert!(store.update_metadata("kb", "ghost", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        seed(&store, "kb", "a", "one", "fact").await;
        store.delete("kb", "a").await.unwrap();
        store.delete("kb", "a").await.unwrap();
        assert!(store.get("kb", GetRequest::by_ids(["a"])).await.unwrap().is_empty());
    }

    #[test]
    fn similarity_from_distance_clamps_to_unit_range() {
        assert!((similarity_from_distance(0.0) - 1.0).abs() < f32::EPSILON);
        assert!((similarity_from_distance(1.0)).abs() < f32::EPSILON);
        assert!((similarity_from_distance(2.0) + 1.0).abs() < f32::EPSILON);
        assert!((similarity_from_distance(-0.5) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn cosine_similarity_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn token_embedding_is_deterministic() {
        let a = token_embedding("The lake froze; the LAKE froze.");
        let b = token_embedding("The lake froze; the LAKE froze.");
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }
}
