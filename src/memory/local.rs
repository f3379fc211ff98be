//! In-memory collection store.
//!
//! Reference implementation of the [`CollectionStore`] contract: brute-force
//! cosine search over points held in process memory. Used as the default
//! backend in tests and for small offline deployments; a networked vector
//! database implements the same trait for production.
//!
//! Similarity is reported as `(cosine + 1) / 2`, mapping the raw cosine range
//! `[-1, 1]` onto the contract's `[0, 1]`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::collection::{
    CollectionConfig, CollectionError, CollectionInfo, CollectionResult, CollectionStore,
    PointRecord, SearchHit,
};
use super::embedding::cosine_similarity;
use super::types::SearchFilter;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredPoint {
    vector: Vec<f32>,
    payload: Value,
    /// Monotonic insertion sequence, used to break similarity ties by
    /// recency.
    seq: u64,
}

#[derive(Debug)]
struct CollectionData {
    config: CollectionConfig,
    /// Points keyed by id; `BTreeMap` gives scroll its stable ascending-id
    /// order.
    points: BTreeMap<String, StoredPoint>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, CollectionData>,
    next_seq: u64,
    /// When `true`, every operation fails with a transient error.
    unavailable: bool,
    /// Number of upcoming operations that fail with a transient error.
    injected_failures: usize,
}

impl Inner {
    fn fail_if_injected(&mut self, op: &str) -> CollectionResult<()> {
        if self.unavailable {
            return Err(CollectionError::Transient(format!(
                "{op}: backend unavailable"
            )));
        }
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(CollectionError::Transient(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn collection(&self, name: &str) -> CollectionResult<&CollectionData> {
        self.collections
            .get(name)
            .ok_or_else(|| CollectionError::NotFound(name.to_owned()))
    }

    fn collection_mut(&mut self, name: &str) -> CollectionResult<&mut CollectionData> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| CollectionError::NotFound(name.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory [`CollectionStore`] with brute-force cosine search.
#[derive(Debug, Default)]
pub struct InMemoryCollectionStore {
    inner: Mutex<Inner>,
}

impl InMemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail transiently until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Make the next `count` operations fail transiently, then recover.
    pub async fn inject_failures(&self, count: usize) {
        self.inner.lock().await.injected_failures = count;
    }

    /// Names of all existing collections, sorted.
    pub async fn collection_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.collections.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl CollectionStore for InMemoryCollectionStore {
    async fn create_collection(&self, config: &CollectionConfig) -> CollectionResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("create_collection")?;

        if config.vector_dimension == 0 {
            return Err(CollectionError::Permanent(
                "vector dimension must be non-zero".to_owned(),
            ));
        }

        if let Some(existing) = inner.collections.get(&config.name) {
            if existing.config.vector_dimension != config.vector_dimension {
                return Err(CollectionError::DimensionMismatch {
                    collection: config.name.clone(),
                    existing: existing.config.vector_dimension,
                    requested: config.vector_dimension,
                });
            }
            return Ok(false);
        }

        debug!(
            "creating collection '{}' (dim={}, model={})",
            config.name, config.vector_dimension, config.embedding_model
        );
        inner.collections.insert(
            config.name.clone(),
            CollectionData {
                config: config.clone(),
                points: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn describe(&self, collection: &str) -> CollectionResult<CollectionInfo> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("describe")?;
        let data = inner.collection(collection)?;
        Ok(CollectionInfo {
            config: data.config.clone(),
            points: data.points.len(),
        })
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> CollectionResult<()> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("upsert")?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let data = inner.collection_mut(collection)?;
        if vector.len() != data.config.vector_dimension {
            return Err(CollectionError::DimensionMismatch {
                collection: collection.to_owned(),
                existing: data.config.vector_dimension,
                requested: vector.len(),
            });
        }
        data.points.insert(
            id.to_owned(),
            StoredPoint {
                vector,
                payload,
                seq,
            },
        );
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> CollectionResult<Vec<SearchHit>> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("search")?;
        let data = inner.collection(collection)?;
        if query.len() != data.config.vector_dimension {
            return Err(CollectionError::DimensionMismatch {
                collection: collection.to_owned(),
                existing: data.config.vector_dimension,
                requested: query.len(),
            });
        }

        let min_similarity = filter.and_then(|f| f.min_similarity);
        let mut scored: Vec<(f32, u64, SearchHit)> = Vec::new();
        for (id, point) in &data.points {
            if let Some(f) = filter {
                if !f.matches_payload(&point.payload) {
                    continue;
                }
            }
            let similarity = (cosine_similarity(query, &point.vector) + 1.0) / 2.0;
            if let Some(min) = min_similarity {
                if similarity < min {
                    continue;
                }
            }
            scored.push((
                similarity,
                point.seq,
                SearchHit {
                    id: id.clone(),
                    payload: point.payload.clone(),
                    similarity,
                },
            ));
        }

        // Similarity descending; ties broken by insertion recency.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        Ok(scored.into_iter().take(limit).map(|(_, _, hit)| hit).collect())
    }

    async fn count(
        &self,
        collection: &str,
        filter: Option<&SearchFilter>,
    ) -> CollectionResult<usize> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("count")?;
        let data = inner.collection(collection)?;
        let count = match filter {
            None => data.points.len(),
            Some(f) => data
                .points
                .values()
                .filter(|p| f.matches_payload(&p.payload))
                .count(),
        };
        Ok(count)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
        offset: usize,
    ) -> CollectionResult<Vec<PointRecord>> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("scroll")?;
        let data = inner.collection(collection)?;
        let page = data
            .points
            .iter()
            .filter(|(_, p)| filter.is_none_or(|f| f.matches_payload(&p.payload)))
            .skip(offset)
            .take(limit)
            .map(|(id, p)| PointRecord {
                id: id.clone(),
                payload: p.payload.clone(),
            })
            .collect();
        Ok(page)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> CollectionResult<()> {
        let mut inner = self.inner.lock().await;
        inner.fail_if_injected("delete")?;
        let data = inner.collection_mut(collection)?;
        for id in ids {
            data.points.remove(id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::memory::collection::DistanceMetric;
    use serde_json::json;

    fn config(name: &str, dim: usize) -> CollectionConfig {
        CollectionConfig {
            name: name.to_owned(),
            vector_dimension: dim,
            distance_metric: DistanceMetric::Cosine,
            embedding_model: "test-model".to_owned(),
        }
    }

    #[tokio::test]
    async fn create_collection_is_idempotent() {
        let store = InMemoryCollectionStore::new();
        assert!(store.create_collection(&config("memories", 4)).await.unwrap());
        // Second creation with identical config: no-op success.
        assert!(!store.create_collection(&config("memories", 4)).await.unwrap());
    }

    #[tokio::test]
    async fn create_collection_rejects_conflicting_dimension() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 4)).await.unwrap();
        let err = store
            .create_collection(&config("memories", 8))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::DimensionMismatch { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn operations_on_missing_collection_are_not_found() {
        let store = InMemoryCollectionStore::new();
        let err = store.describe("ghost").await.unwrap_err();
        assert!(matches!(err, CollectionError::NotFound(_)));
        let err = store.count("ghost", None).await.unwrap_err();
        assert!(matches!(err, CollectionError::NotFound(_)));
    }

    #[tokio::test]
    async fn upsert_is_last_write_wins() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 2)).await.unwrap();
        store
            .upsert("memories", "a", vec![1.0, 0.0], json!({"v": 1}))
            .await
            .unwrap();
        store
            .upsert("memories", "a", vec![0.0, 1.0], json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(store.count("memories", None).await.unwrap(), 1);
        let page = store.scroll("memories", None, 10, 0).await.unwrap();
        assert_eq!(page[0].payload, json!({"v": 2}));
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 2)).await.unwrap();
        let err = store
            .upsert("memories", "a", vec![1.0, 0.0, 0.0], json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn search_orders_by_similarity_descending() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 2)).await.unwrap();
        store
            .upsert("memories", "exact", vec![1.0, 0.0], json!({}))
            .await
            .unwrap();
        store
            .upsert("memories", "orthogonal", vec![0.0, 1.0], json!({}))
            .await
            .unwrap();
        store
            .upsert("memories", "opposite", vec![-1.0, 0.0], json!({}))
            .await
            .unwrap();

        let hits = store.search("memories", &[1.0, 0.0], 10, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "orthogonal", "opposite"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!((hits[1].similarity - 0.5).abs() < 1e-6);
        assert!(hits[2].similarity.abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_ties_break_by_recency() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 2)).await.unwrap();
        store
            .upsert("memories", "older", vec![1.0, 0.0], json!({}))
            .await
            .unwrap();
        store
            .upsert("memories", "newer", vec![1.0, 0.0], json!({}))
            .await
            .unwrap();
        let hits = store.search("memories", &[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits[0].id, "newer");
        assert_eq!(hits[1].id, "older");
    }

    #[tokio::test]
    async fn search_applies_min_similarity() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 2)).await.unwrap();
        store
            .upsert("memories", "far", vec![-1.0, 0.0], json!({}))
            .await
            .unwrap();
        let filter = SearchFilter {
            min_similarity: Some(0.4),
            ..SearchFilter::default()
        };
        let hits = store
            .search("memories", &[1.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn scroll_pages_in_ascending_id_order() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 1)).await.unwrap();
        for id in ["c", "a", "b", "d"] {
            store
                .upsert("memories", id, vec![1.0], json!({}))
                .await
                .unwrap();
        }
        let first = store.scroll("memories", None, 2, 0).await.unwrap();
        let second = store.scroll("memories", None, 2, 2).await.unwrap();
        let ids: Vec<&str> = first
            .iter()
            .chain(second.iter())
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn delete_removes_points_and_ignores_unknown_ids() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 1)).await.unwrap();
        store.upsert("memories", "a", vec![1.0], json!({})).await.unwrap();
        store
            .delete("memories", &["a".to_owned(), "ghost".to_owned()])
            .await
            .unwrap();
        assert_eq!(store.count("memories", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_recover() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 1)).await.unwrap();
        store.inject_failures(2).await;

        let err = store.count("memories", None).await.unwrap_err();
        assert!(err.is_transient());
        let err = store.count("memories", None).await.unwrap_err();
        assert!(err.is_transient());
        // Third call recovers.
        assert_eq!(store.count("memories", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_everything() {
        let store = InMemoryCollectionStore::new();
        store.create_collection(&config("memories", 1)).await.unwrap();
        store.set_unavailable(true).await;
        assert!(store.describe("memories").await.is_err());
        store.set_unavailable(false).await;
        assert!(store.describe("memories").await.is_ok());
    }
}
