//! Scoped vector store
//!
//! A content-addressed vector index over the key-value collaborator.
//! Not a general ANN index: search is an exact cosine scan over a
//! scope-filtered candidate set, so per-dataset retrieval stays
//! proportional to that dataset's notes.
//!
//! Key layout:
//! - vector records:  `{prefix}:vector:{owner}:{scope}:{id}`
//! - scope indexes:   `{prefix}:index:{scope}:{dataset_ref | "global"}`
//! - id directory:    `{prefix}:id:{id}` → record key
//! - catalog:         `{prefix}:catalog` (set of all record keys)

pub mod embedding;
pub mod notes;
pub mod types;

pub use embedding::{DeterministicEmbedder, Embedder, HttpEmbedder};
pub use notes::NoteManager;
pub use types::*;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::VectorConfig;
use crate::storage::KvStore;
use crate::types::{DatasetId, NoteId, StoreError, UserId, VectorError};

/// Cosine similarity between two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Scoped semantic retrieval over embedded notes.
pub struct VectorStore {
    kv: Arc<dyn KvStore>,
    config: VectorConfig,
}

impl VectorStore {
    pub fn new(kv: Arc<dyn KvStore>, config: VectorConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &VectorConfig {
        &self.config
    }

    fn vector_key(&self, owner: UserId, scope: NoteScope, id: NoteId) -> String {
        format!("{}:vector:{}:{}:{}", self.config.key_prefix, owner, scope, id)
    }

    fn index_key(&self, scope: NoteScope, dataset_ref: Option<DatasetId>) -> String {
        let suffix = match (scope, dataset_ref) {
            (NoteScope::Dataset, Some(dataset)) => dataset.to_string(),
            _ => "global".to_string(),
        };
        format!("{}:index:{}:{}", self.config.key_prefix, scope, suffix)
    }

    fn id_key(&self, id: NoteId) -> String {
        format!("{}:id:{}", self.config.key_prefix, id)
    }

    fn catalog_key(&self) -> String {
        format!("{}:catalog", self.config.key_prefix)
    }

    fn validate_embedding(&self, embedding: &[f32]) -> Result<(), VectorError> {
        if embedding.is_empty() {
            return Err(VectorError::InvalidEmbedding {
                reason: "embedding is empty".to_string(),
            });
        }
        if embedding.len() > self.config.max_dimension {
            return Err(VectorError::InvalidEmbedding {
                reason: format!(
                    "dimension {} exceeds maximum {}",
                    embedding.len(),
                    self.config.max_dimension
                ),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::InvalidEmbedding {
                reason: "embedding contains non-finite values".to_string(),
            });
        }
        Ok(())
    }

    fn store_err(e: StoreError) -> VectorError {
        VectorError::StoreUnavailable(e.to_string())
    }

    /// Store a note and register it in its scope index.
    pub async fn put(&self, note: &VectorNote, embedding: Vec<f32>) -> Result<(), VectorError> {
        self.validate_embedding(&embedding)?;

        match (note.scope, note.dataset_ref) {
            (NoteScope::Dataset, None) => {
                return Err(VectorError::InvalidEmbedding {
                    reason: "dataset-scoped note without dataset_ref".to_string(),
                })
            }
            (NoteScope::Global, Some(_)) => {
                return Err(VectorError::InvalidEmbedding {
                    reason: "global note must not carry a dataset_ref".to_string(),
                })
            }
            _ => {}
        }

        let key = self.vector_key(note.owner, note.scope, note.id);
        let record = VectorRecord {
            data: note.clone(),
            dimension: embedding.len(),
            embedding,
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| VectorError::StoreUnavailable(e.to_string()))?;

        self.kv
            .set(&key, &raw, Some(self.config.note_ttl))
            .await
            .map_err(Self::store_err)?;
        self.kv
            .sadd(&self.index_key(note.scope, note.dataset_ref), &key)
            .await
            .map_err(Self::store_err)?;
        self.kv
            .sadd(&self.catalog_key(), &key)
            .await
            .map_err(Self::store_err)?;
        self.kv
            .set(&self.id_key(note.id), &key, Some(self.config.note_ttl))
            .await
            .map_err(Self::store_err)?;

        tracing::debug!(note = %note.id, scope = %note.scope, "stored vector note");
        Ok(())
    }

    /// Rank scope candidates by cosine similarity against `query`.
    ///
    /// Owner filtering happens after scope filtering and before any
    /// similarity computation. Ties break on most recent `created_at`.
    /// Usage counters on returned notes are bumped best-effort.
    pub async fn search(
        &self,
        query: &[f32],
        scope: NoteScope,
        dataset_ref: Option<DatasetId>,
        owner: Option<UserId>,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, VectorError> {
        self.validate_embedding(query)?;

        let candidates = self
            .kv
            .smembers(&self.index_key(scope, dataset_ref))
            .await
            .map_err(Self::store_err)?;

        let owner_fragment = owner.map(|o| format!(":vector:{}:", o));
        let mut scored: Vec<(SearchHit, String, String)> = Vec::new();

        for key in candidates {
            if let Some(ref fragment) = owner_fragment {
                if !key.contains(fragment.as_str()) {
                    continue;
                }
            }
            let raw = match self.kv.get(&key).await.map_err(Self::store_err)? {
                Some(raw) => raw,
                None => {
                    // Record expired underneath its index entry; drop the
                    // stale membership and move on.
                    let _ = self.kv.srem(&self.index_key(scope, dataset_ref), &key).await;
                    continue;
                }
            };
            let record: VectorRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable vector record");
                    continue;
                }
            };
            let similarity = cosine_similarity(query, &record.embedding);
            if similarity >= threshold {
                scored.push((
                    SearchHit {
                        note: record.data,
                        similarity,
                    },
                    key,
                    raw,
                ));
            }
        }

        scored.sort_by(|a, b| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.note.created_at.cmp(&a.0.note.created_at))
        });
        scored.truncate(top_k);

        for (hit, key, raw) in &scored {
            self.bump_usage(key, raw).await;
            let _ = self.kv.expire(key, self.config.note_ttl).await;
            tracing::trace!(note = %hit.note.id, similarity = hit.similarity, "search hit");
        }

        Ok(scored.into_iter().map(|(hit, _, _)| hit).collect())
    }

    /// Increment `usage_count` and refresh `last_accessed` with a bounded
    /// compare-and-set loop. Never fails the surrounding search.
    async fn bump_usage(&self, key: &str, raw: &str) {
        let mut current = raw.to_string();
        for _ in 0..3 {
            let mut record: VectorRecord = match serde_json::from_str(&current) {
                Ok(record) => record,
                Err(_) => return,
            };
            record.data.usage_count += 1;
            record.data.last_accessed = Utc::now();
            let updated = match serde_json::to_string(&record) {
                Ok(updated) => updated,
                Err(_) => return,
            };
            match self.kv.compare_and_swap(key, &current, &updated).await {
                Ok(true) => return,
                Ok(false) => match self.kv.get(key).await {
                    Ok(Some(latest)) => current = latest,
                    _ => return,
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "usage bump failed");
                    return;
                }
            }
        }
        tracing::warn!(key = %key, "usage bump abandoned after contention");
    }

    /// Remove a note and its index memberships.
    pub async fn delete(&self, id: NoteId) -> Result<bool, VectorError> {
        let id_key = self.id_key(id);
        let Some(key) = self.kv.get(&id_key).await.map_err(Self::store_err)? else {
            return Ok(false);
        };

        if let Some(raw) = self.kv.get(&key).await.map_err(Self::store_err)? {
            if let Ok(record) = serde_json::from_str::<VectorRecord>(&raw) {
                let index = self.index_key(record.data.scope, record.data.dataset_ref);
                self.kv.srem(&index, &key).await.map_err(Self::store_err)?;
            }
        }
        self.kv
            .srem(&self.catalog_key(), &key)
            .await
            .map_err(Self::store_err)?;
        self.kv.delete(&id_key).await.map_err(Self::store_err)?;
        let existed = self.kv.delete(&key).await.map_err(Self::store_err)?;
        Ok(existed)
    }

    /// Mass-delete every note in a scope, optionally restricted to an
    /// owner. Returns the number of notes removed.
    pub async fn clear(
        &self,
        scope: NoteScope,
        dataset_ref: Option<DatasetId>,
        owner: Option<UserId>,
    ) -> Result<usize, VectorError> {
        let index = self.index_key(scope, dataset_ref);
        let members = self.kv.smembers(&index).await.map_err(Self::store_err)?;
        let owner_fragment = owner.map(|o| format!(":vector:{}:", o));

        let mut removed = 0;
        for key in members {
            if let Some(ref fragment) = owner_fragment {
                if !key.contains(fragment.as_str()) {
                    continue;
                }
            }
            if let Some(raw) = self.kv.get(&key).await.map_err(Self::store_err)? {
                if let Ok(record) = serde_json::from_str::<VectorRecord>(&raw) {
                    let _ = self.kv.delete(&self.id_key(record.data.id)).await;
                }
            }
            self.kv.srem(&index, &key).await.map_err(Self::store_err)?;
            let _ = self.kv.srem(&self.catalog_key(), &key).await;
            if self.kv.delete(&key).await.map_err(Self::store_err)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete notes created more than `age` ago. Used by maintenance.
    pub async fn purge_older_than(&self, age: Duration) -> Result<usize, VectorError> {
        let cutoff = match chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return Ok(0),
        };
        let members = self
            .kv
            .smembers(&self.catalog_key())
            .await
            .map_err(Self::store_err)?;

        let mut removed = 0;
        for key in members {
            let Some(raw) = self.kv.get(&key).await.map_err(Self::store_err)? else {
                let _ = self.kv.srem(&self.catalog_key(), &key).await;
                continue;
            };
            let Ok(record) = serde_json::from_str::<VectorRecord>(&raw) else {
                continue;
            };
            if record.data.created_at < cutoff && self.delete(record.data.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Index statistics, optionally restricted to one owner.
    pub async fn stats(&self, owner: Option<UserId>) -> Result<VectorStats, VectorError> {
        let members = self
            .kv
            .smembers(&self.catalog_key())
            .await
            .map_err(Self::store_err)?;
        let owner_fragment = owner.map(|o| format!(":vector:{}:", o));

        let mut stats = VectorStats::default();
        for key in members {
            if let Some(ref fragment) = owner_fragment {
                if !key.contains(fragment.as_str()) {
                    continue;
                }
            }
            if self.kv.get(&key).await.map_err(Self::store_err)?.is_some() {
                stats.total_notes += 1;
                if key.contains(":dataset:") {
                    stats.dataset_scoped += 1;
                } else {
                    stats.global_scoped += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;

    fn store() -> VectorStore {
        VectorStore::new(Arc::new(InMemoryKvStore::new()), VectorConfig::default())
    }

    fn unit_vec(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn put_rejects_invalid_embeddings() {
        let store = store();
        let owner = UserId::new();
        let note = VectorNote::new(
            owner,
            NoteScope::Global,
            None,
            NoteContentType::Insight,
            "t",
            "x",
            0.9,
        );
        assert!(matches!(
            store.put(&note, vec![]).await,
            Err(VectorError::InvalidEmbedding { .. })
        ));
        assert!(matches!(
            store.put(&note, vec![f32::NAN; 4]).await,
            Err(VectorError::InvalidEmbedding { .. })
        ));
        assert!(matches!(
            store.put(&note, vec![0.5; 385]).await,
            Err(VectorError::InvalidEmbedding { .. })
        ));
    }

    #[tokio::test]
    async fn put_enforces_scope_invariants() {
        let store = store();
        let owner = UserId::new();
        let dataset_note = VectorNote::new(
            owner,
            NoteScope::Dataset,
            None,
            NoteContentType::Insight,
            "t",
            "x",
            0.9,
        );
        assert!(store.put(&dataset_note, vec![1.0, 0.0]).await.is_err());

        let global_note = VectorNote::new(
            owner,
            NoteScope::Global,
            Some(DatasetId::new()),
            NoteContentType::Insight,
            "t",
            "x",
            0.9,
        );
        assert!(store.put(&global_note, vec![1.0, 0.0]).await.is_err());
    }

    #[tokio::test]
    async fn scopes_partition_the_search_space() {
        let store = store();
        let owner = UserId::new();
        let dataset = DatasetId::new();

        let scoped = VectorNote::new(
            owner,
            NoteScope::Dataset,
            Some(dataset),
            NoteContentType::Insight,
            "scoped",
            "scoped",
            0.9,
        );
        let global = VectorNote::new(
            owner,
            NoteScope::Global,
            None,
            NoteContentType::Insight,
            "global",
            "global",
            0.9,
        );
        store.put(&scoped, unit_vec(8, 0)).await.unwrap();
        store.put(&global, unit_vec(8, 0)).await.unwrap();

        let dataset_hits = store
            .search(&unit_vec(8, 0), NoteScope::Dataset, Some(dataset), Some(owner), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(dataset_hits.len(), 1);
        assert_eq!(dataset_hits[0].note.id, scoped.id);

        let global_hits = store
            .search(&unit_vec(8, 0), NoteScope::Global, None, Some(owner), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(global_hits.len(), 1);
        assert_eq!(global_hits[0].note.id, global.id);
    }

    #[tokio::test]
    async fn search_filters_by_owner() {
        let store = store();
        let dataset = DatasetId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        for owner in [alice, bob] {
            let note = VectorNote::new(
                owner,
                NoteScope::Dataset,
                Some(dataset),
                NoteContentType::Insight,
                "n",
                "n",
                0.9,
            );
            store.put(&note, unit_vec(4, 1)).await.unwrap();
        }

        let hits = store
            .search(&unit_vec(4, 1), NoteScope::Dataset, Some(dataset), Some(alice), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note.owner, alice);
    }

    #[tokio::test]
    async fn search_bumps_usage_exactly_once() {
        let store = store();
        let owner = UserId::new();
        let dataset = DatasetId::new();
        let note = VectorNote::new(
            owner,
            NoteScope::Dataset,
            Some(dataset),
            NoteContentType::Insight,
            "n",
            "n",
            0.9,
        );
        store.put(&note, unit_vec(4, 0)).await.unwrap();

        store
            .search(&unit_vec(4, 0), NoteScope::Dataset, Some(dataset), Some(owner), 1, 0.5)
            .await
            .unwrap();
        let hits = store
            .search(&unit_vec(4, 0), NoteScope::Dataset, Some(dataset), Some(owner), 1, 0.5)
            .await
            .unwrap();
        assert_eq!(hits[0].note.usage_count, 1);
    }

    #[tokio::test]
    async fn delete_removes_note_and_index_entry() {
        let store = store();
        let owner = UserId::new();
        let note = VectorNote::new(
            owner,
            NoteScope::Global,
            None,
            NoteContentType::Insight,
            "n",
            "n",
            0.9,
        );
        store.put(&note, unit_vec(4, 2)).await.unwrap();
        assert!(store.delete(note.id).await.unwrap());
        assert!(!store.delete(note.id).await.unwrap());

        let hits = store
            .search(&unit_vec(4, 2), NoteScope::Global, None, Some(owner), 10, 0.0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn stats_count_by_scope() {
        let store = store();
        let owner = UserId::new();
        let dataset = DatasetId::new();
        let scoped = VectorNote::new(
            owner,
            NoteScope::Dataset,
            Some(dataset),
            NoteContentType::Insight,
            "s",
            "s",
            0.9,
        );
        let global = VectorNote::new(
            owner,
            NoteScope::Global,
            None,
            NoteContentType::Insight,
            "g",
            "g",
            0.9,
        );
        store.put(&scoped, unit_vec(4, 0)).await.unwrap();
        store.put(&global, unit_vec(4, 1)).await.unwrap();

        let stats = store.stats(Some(owner)).await.unwrap();
        assert_eq!(stats.total_notes, 2);
        assert_eq!(stats.dataset_scoped, 1);
        assert_eq!(stats.global_scoped, 1);
        assert_eq!(store.stats(Some(UserId::new())).await.unwrap().total_notes, 0);
    }

    #[tokio::test]
    async fn clear_scope_respects_owner_filter() {
        let store = store();
        let dataset = DatasetId::new();
        let alice = UserId::new();
        let bob = UserId::new();
        for owner in [alice, bob] {
            let note = VectorNote::new(
                owner,
                NoteScope::Dataset,
                Some(dataset),
                NoteContentType::Insight,
                "n",
                "n",
                0.9,
            );
            store.put(&note, unit_vec(4, 0)).await.unwrap();
        }

        let removed = store
            .clear(NoteScope::Dataset, Some(dataset), Some(alice))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = store
            .search(&unit_vec(4, 0), NoteScope::Dataset, Some(dataset), None, 10, 0.5)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].note.owner, bob);
    }
}
