//! Vector collection backend contract.
//!
//! The store treats the vector database as a black box behind
//! [`CollectionStore`]: named collections with a fixed dimensionality and
//! distance metric, point upserts, filtered similarity search, counting,
//! scrolling, and deletion. Backends distinguish transient failures (worth
//! retrying) from permanent ones (configuration mistakes, missing
//! collections) via [`CollectionError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::types::SearchFilter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by a collection backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectionError {
    /// Transient failure (timeout, connection refused). Retried by callers.
    #[error("transient collection error: {0}")]
    Transient(String),

    /// The named collection does not exist. Permanent.
    #[error("collection not found: {0}")]
    NotFound(String),

    /// An existing collection has a conflicting dimensionality. Permanent.
    #[error(
        "dimension mismatch for collection '{collection}': existing {existing}, requested {requested}"
    )]
    DimensionMismatch {
        collection: String,
        existing: usize,
        requested: usize,
    },

    /// Any other permanent failure (malformed request, unsupported metric).
    #[error("permanent collection error: {0}")]
    Permanent(String),
}

impl CollectionError {
    /// Returns `true` if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollectionError::Transient(_))
    }
}

pub type CollectionResult<T> = std::result::Result<T, CollectionError>;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Distance metric used by a collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
}

/// Immutable configuration of a collection.
///
/// A dimensionality or model change always implies a new collection, never
/// an in-place mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionConfig {
    pub name: String,
    pub vector_dimension: usize,
    pub distance_metric: DistanceMetric,
    pub embedding_model: String,
}

/// Description of an existing collection, as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub config: CollectionConfig,
    /// Number of points currently stored.
    pub points: usize,
}

/// One similarity-search hit: point id, stored payload, similarity in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub payload: Value,
    pub similarity: f32,
}

/// One point returned by a scroll page: id plus stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: String,
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Contract the core consumes from the vector backend.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Create a collection. Idempotent: if it already exists with a matching
    /// dimensionality, returns `Ok(false)` without modification; a
    /// conflicting dimensionality is a [`CollectionError::DimensionMismatch`].
    /// Returns `Ok(true)` when the collection was newly created.
    async fn create_collection(&self, config: &CollectionConfig) -> CollectionResult<bool>;

    /// Describe an existing collection.
    async fn describe(&self, collection: &str) -> CollectionResult<CollectionInfo>;

    /// Insert or replace a point. Last write wins per id.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> CollectionResult<()>;

    /// Similarity-search a collection. Results are ordered by similarity
    /// descending, ties broken by insertion recency.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> CollectionResult<Vec<SearchHit>>;

    /// Count points matching the filter.
    async fn count(&self, collection: &str, filter: Option<&SearchFilter>)
    -> CollectionResult<usize>;

    /// Page through a collection in stable (ascending id) order.
    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
        offset: usize,
    ) -> CollectionResult<Vec<PointRecord>>;

    /// Delete points by id. Unknown ids are ignored.
    async fn delete(&self, collection: &str, ids: &[String]) -> CollectionResult<()>;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry policy for transient backend failures.
///
/// Transient errors are retried up to `max_attempts` with a fixed backoff;
/// permanent errors are returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op`, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> CollectionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CollectionResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    debug!("{what}: transient failure (attempt {attempt}): {err}; retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl From<crate::config::RetrySettings> for RetryPolicy {
    fn from(settings: crate::config::RetrySettings) -> Self {
        Self::new(settings.max_attempts, Duration::from_millis(settings.backoff_ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_classification() {
        assert!(CollectionError::Transient("timeout".into()).is_transient());
        assert!(!CollectionError::NotFound("memories".into()).is_transient());
        assert!(!CollectionError::Permanent("bad metric".into()).is_transient());
        assert!(
            !CollectionError::DimensionMismatch {
                collection: "memories".into(),
                existing: 384,
                requested: 768,
            }
            .is_transient()
        );
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = policy
            .run("test op", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CollectionError::Transient("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: CollectionResult<()> = policy
            .run("test op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CollectionError::Transient("always down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_permanent_errors() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: CollectionResult<()> = policy
            .run("test op", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CollectionError::NotFound("memories".into())) }
            })
            .await;
        assert!(matches!(result, Err(CollectionError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collection_config_serde_round_trip() {
        let config = CollectionConfig {
            name: "memories".into(),
            vector_dimension: 384,
            distance_metric: DistanceMetric::Cosine,
            embedding_model: "all-minilm-l6-v2".into(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""cosine""#));
        let restored: CollectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}
