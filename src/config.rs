//! Configuration types for the memory store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::memory::collection::DistanceMetric;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default name of the primary memory collection.
pub(crate) const DEFAULT_COLLECTION_NAME: &str = "memories";

/// Default embedding model identifier.
pub(crate) const DEFAULT_EMBEDDING_MODEL: &str = "all-minilm-l6-v2";

/// Default embedding dimensionality (all-MiniLM-L6-v2).
pub(crate) const DEFAULT_VECTOR_DIMENSION: usize = 384;

/// Default minimum similarity for search hits.
pub(crate) const DEFAULT_MIN_SIMILARITY: f32 = 0.3;

pub(crate) const DEFAULT_BATCH_SIZE: usize = 50;
pub(crate) const DEFAULT_BATCH_DELAY_MS: u64 = 100;
pub(crate) const DEFAULT_QUALITY_THRESHOLD: f64 = 0.75;
pub(crate) const DEFAULT_ROLLBACK_THRESHOLD: f64 = 0.6;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_VALIDATION_SAMPLE_SIZE: usize = 20;
pub(crate) const DEFAULT_MAX_TIME_HOURS: u64 = 24;
pub(crate) const DEFAULT_STABILITY_WINDOW_SECS: u64 = 0;

pub(crate) const DEFAULT_RRF_K: f64 = 60.0;

pub(crate) const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub(crate) const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;

pub(crate) const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Filename of the persisted migration state document inside `root_dir`.
pub(crate) const MIGRATION_STATE_FILE: &str = "migration-state.json";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration for a memory store instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MnemoConfig {
    /// Root directory for durable state (migration state file).
    pub root_dir: PathBuf,
    /// Primary collection settings.
    pub collection: CollectionSettings,
    /// Embedding-model migration settings.
    pub migration: MigrationConfig,
    /// Search result fusion settings.
    pub fusion: FusionConfig,
    /// Circuit breaker settings for backend calls.
    pub breaker: BreakerConfig,
    /// Retry policy for transient backend failures.
    pub retry: RetrySettings,
}

impl Default for MnemoConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("mnemo"),
            collection: CollectionSettings::default(),
            migration: MigrationConfig::default(),
            fusion: FusionConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl MnemoConfig {
    /// Path of the persisted migration state document.
    pub fn migration_state_path(&self) -> PathBuf {
        self.root_dir.join(MIGRATION_STATE_FILE)
    }
}

/// Primary collection settings.
///
/// Dimensionality and model are fixed for the collection's lifetime; changing
/// either means migrating to a new collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    /// Collection name.
    pub name: String,
    /// Vector dimensionality.
    pub vector_dimension: usize,
    /// Distance metric for similarity search.
    pub distance_metric: DistanceMetric,
    /// Embedding model identifier for this collection.
    pub embedding_model: String,
    /// Default minimum similarity applied to searches without an explicit
    /// filter threshold.
    pub min_similarity: f32,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_COLLECTION_NAME.to_owned(),
            vector_dimension: DEFAULT_VECTOR_DIMENSION,
            distance_metric: DistanceMetric::Cosine,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_owned(),
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }
}

/// Embedding-model migration settings.
///
/// A copy of this struct is frozen into the migration state tracker when a
/// migration starts, so mid-flight config edits never change a running
/// migration's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Records re-embedded per batch during gradual migration.
    pub batch_size: usize,
    /// Pause between batches, bounding backend load.
    pub batch_delay_ms: u64,
    /// Canary quality ratio required to advance past canary testing.
    pub quality_threshold: f64,
    /// Canary quality ratio below which the migration auto-rolls-back.
    pub rollback_threshold: f64,
    /// Per-record retry attempts before the record is skipped and counted.
    pub max_retries: u32,
    /// Number of source records sampled during canary testing.
    pub validation_sample_size: usize,
    /// Advisory wall-clock budget; exceeding it flags the migration unhealthy.
    pub max_time_hours: u64,
    /// Minimum time spent in full migration before cleanup is accepted.
    pub stability_window_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            rollback_threshold: DEFAULT_ROLLBACK_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            validation_sample_size: DEFAULT_VALIDATION_SAMPLE_SIZE,
            max_time_hours: DEFAULT_MAX_TIME_HOURS,
            stability_window_secs: DEFAULT_STABILITY_WINDOW_SECS,
        }
    }
}

/// Search result fusion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Reciprocal Rank Fusion constant.
    ///
    /// Discounts the influence of any single rank-1 hit and smooths the
    /// score curve for lower ranks. 60 is the standard literature value.
    pub rrf_k: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { rrf_k: DEFAULT_RRF_K }
    }
}

/// Circuit breaker settings for collection-store calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before allowing a half-open probe.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
        }
    }
}

/// Retry policy settings for transient backend failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum attempts per call (first attempt included).
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_collection_settings() {
        let cfg = CollectionSettings::default();
        assert_eq!(cfg.name, "memories");
        assert_eq!(cfg.vector_dimension, 384);
        assert_eq!(cfg.embedding_model, "all-minilm-l6-v2");
    }

    #[test]
    fn default_migration_config() {
        let cfg = MigrationConfig::default();
        assert_eq!(cfg.batch_size, 50);
        assert!((cfg.quality_threshold - 0.75).abs() < f64::EPSILON);
        assert!((cfg.rollback_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.validation_sample_size, 20);
        assert_eq!(cfg.max_time_hours, 24);
    }

    #[test]
    fn config_deserializes_from_partial_json() {
        let json = r#"{"migration": {"batch_size": 5}}"#;
        let cfg: MnemoConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.migration.batch_size, 5);
        // Untouched fields fall back to defaults.
        assert_eq!(cfg.migration.max_retries, 3);
        assert_eq!(cfg.collection.name, "memories");
    }

    #[test]
    fn migration_state_path_is_under_root() {
        let cfg = MnemoConfig {
            root_dir: PathBuf::from("/tmp/mnemo-test"),
            ..MnemoConfig::default()
        };
        assert_eq!(
            cfg.migration_state_path(),
            PathBuf::from("/tmp/mnemo-test/migration-state.json")
        );
    }

    #[test]
    fn config_serde_round_trip() {
        let cfg = MnemoConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let restored: MnemoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.collection.vector_dimension, 384);
        assert_eq!(restored.fusion.rrf_k, cfg.fusion.rrf_k);
    }
}
