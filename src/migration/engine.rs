//! Embedding-model migration state machine.
//!
//! The engine drives one migration from a source collection/model to a
//! target collection/model, one step at a time:
//!
//! - `Preparation`: create the target collection, validate the source is
//!   readable.
//! - `ShadowMode`: both collections must answer health probes; the manager
//!   dual-writes and fuses reads from here on.
//! - `CanaryTesting`: re-embed a sample of source records with the target
//!   model, seed them into the target collection, and compare retrieval
//!   quality across the two spaces. A ratio below the rollback threshold
//!   triggers automatic rollback; between the thresholds the canary is
//!   re-measured on the next step.
//! - `GradualMigration`: the first step snapshots the source count (the
//!   plan); each following step re-embeds exactly one batch in stable
//!   ascending-id order, so progress is resumable after a crash.
//! - `FullMigration`: the target is read-authoritative; an explicit advance
//!   after the stability window moves on to cleanup.
//! - `Cleanup`: the source collection is retained for archival (never
//!   deleted — it is the only known-good copy until an operator says
//!   otherwise) and the persisted state is finalized.
//!
//! Every mutation of the tracker is persisted before the step returns, so a
//! crash between "decided next state" and "persisted next state" cannot
//! happen. The engine never calls back into the manager.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::error::{MemoryError, Result};
use crate::memory::collection::{
    CollectionConfig, CollectionInfo, CollectionResult, CollectionStore, DistanceMetric,
    PointRecord, RetryPolicy, SearchHit,
};
use crate::memory::embedding::{Embedder, EmbedderProvider};
use crate::memory::types::payload_text;

use super::state::{MigrationState, MigrationStateTracker, StateStore};

/// A batch whose failure rate (after per-record retries) exceeds this
/// fraction aborts the migration instead of producing a silently
/// inconsistent target collection.
pub const BATCH_FAILURE_TOLERANCE: f64 = 0.5;

/// Result limit for the canary's comparative similarity queries.
const CANARY_QUERY_LIMIT: usize = 5;

/// Quality gate names recorded on the tracker.
const GATE_TARGET_CREATED: &str = "target_collection_created";
const GATE_SOURCE_HEALTHY: &str = "source_read_healthy";
const GATE_SHADOW_HEALTH: &str = "shadow_health";
const GATE_CANARY_RATIO: &str = "canary_quality_ratio";
const GATE_SOURCE_ARCHIVED: &str = "source_archived";

/// Outcome of one `execute_step` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Transitioned to a new state.
    Advanced(MigrationState),
    /// Did work (or re-measured a gate) without leaving the current state.
    InProgress(MigrationState),
    /// Quality regression triggered automatic rollback; the migration is
    /// inactive and the tracker should be discarded.
    RolledBack { reason: String },
    /// Cleanup finished; the target collection is now the primary.
    Completed,
    /// Transitioned to `Failed` with the given reason.
    Failed { reason: String },
}

/// Per-record failure classification during batch processing.
enum ItemFailure {
    Retryable(String),
    Fatal(String),
}

/// The migration state machine driver.
///
/// Depends on the tracker (passive data), the collection store, and the
/// embedder provider only.
pub struct MigrationEngine {
    store: Arc<dyn CollectionStore>,
    embedders: Arc<dyn EmbedderProvider>,
    breakers: Arc<BreakerRegistry>,
    state_store: StateStore,
    retry: RetryPolicy,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<dyn CollectionStore>,
        embedders: Arc<dyn EmbedderProvider>,
        breakers: Arc<BreakerRegistry>,
        state_store: StateStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            embedders,
            breakers,
            state_store,
            retry,
        }
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    /// Execute exactly one state-machine step.
    ///
    /// Errors inside a step become a transition to `Failed` with the reason
    /// recorded on the tracker; only persistence failures propagate as `Err`.
    pub async fn execute_step(
        &self,
        tracker: &mut MigrationStateTracker,
    ) -> Result<StepOutcome> {
        let state = tracker.current_state;
        debug!("migration step in state '{state}'");
        let result = match state {
            MigrationState::Preparation => self.step_preparation(tracker).await,
            MigrationState::ShadowMode => self.step_shadow(tracker).await,
            MigrationState::CanaryTesting => self.step_canary(tracker).await,
            MigrationState::GradualMigration => self.step_gradual(tracker).await,
            MigrationState::FullMigration => self.step_full(tracker).await,
            MigrationState::Cleanup | MigrationState::Failed => {
                return Err(MemoryError::Migration(format!(
                    "cannot advance terminal migration state '{state}'"
                )));
            }
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(MemoryError::State(msg)) => Err(MemoryError::State(msg)),
            Err(err) => self.fail(tracker, format!("{state}: {err}")),
        }
    }

    /// Roll the migration back to inactive.
    ///
    /// Dual writes stop, the source collection stays authoritative, and the
    /// partially-populated target collection is deliberately left in place —
    /// never destroy the only good copy of data.
    pub fn rollback(&self, tracker: &MigrationStateTracker, reason: &str) -> Result<()> {
        warn!(
            "rolling back migration '{}' -> '{}': {reason}",
            tracker.source_collection, tracker.target_collection
        );
        self.state_store.clear()
    }

    // -- Phase steps --------------------------------------------------------

    async fn step_preparation(
        &self,
        tracker: &mut MigrationStateTracker,
    ) -> Result<StepOutcome> {
        let target_config = CollectionConfig {
            name: tracker.target_collection.clone(),
            vector_dimension: tracker.target_dimension,
            distance_metric: DistanceMetric::Cosine,
            embedding_model: tracker.target_model.clone(),
        };
        let created = self
            .guarded(&tracker.target_collection, "create target collection", || {
                self.store.create_collection(&target_config)
            })
            .await
            .map_err(|e| MemoryError::Collection(format!("cannot create target collection: {e}")))?;
        tracker.record_gate(GATE_TARGET_CREATED, true, 1.0);
        if created {
            info!(
                "created target collection '{}' (dim={}, model={})",
                tracker.target_collection, tracker.target_dimension, tracker.target_model
            );
        }

        let info = self
            .describe(&tracker.source_collection)
            .await
            .map_err(|e| MemoryError::Collection(format!("source collection unhealthy: {e}")))?;
        tracker.record_gate(GATE_SOURCE_HEALTHY, true, info.points as f64);

        self.advance(tracker, MigrationState::ShadowMode)
    }

    async fn step_shadow(&self, tracker: &mut MigrationStateTracker) -> Result<StepOutcome> {
        let source = self.describe(&tracker.source_collection).await;
        let target = self.describe(&tracker.target_collection).await;
        match (source, target) {
            (Ok(_), Ok(_)) => {
                tracker.record_gate(GATE_SHADOW_HEALTH, true, 1.0);
                self.advance(tracker, MigrationState::CanaryTesting)
            }
            (source, target) => {
                let err = source.err().or(target.err());
                // A permanent probe failure cannot heal; a transient one is
                // re-probed on the next step.
                if let Some(err) = &err {
                    if !err.is_transient() {
                        return Err(MemoryError::Collection(format!(
                            "health probe failed permanently: {err}"
                        )));
                    }
                }
                warn!(
                    "shadow-mode health probe failed, will re-probe: {}",
                    err.map(|e| e.to_string()).unwrap_or_default()
                );
                tracker.record_gate(GATE_SHADOW_HEALTH, false, 0.0);
                self.state_store.save(tracker)?;
                Ok(StepOutcome::InProgress(MigrationState::ShadowMode))
            }
        }
    }

    async fn step_canary(&self, tracker: &mut MigrationStateTracker) -> Result<StepOutcome> {
        let sample_size = tracker.migration_config.validation_sample_size;
        let sample = self
            .scroll(&tracker.source_collection, sample_size, 0)
            .await
            .map_err(|e| MemoryError::Collection(format!("canary sample scroll failed: {e}")))?;

        if sample.is_empty() {
            info!("canary: source collection is empty, nothing to validate");
            tracker.record_gate(GATE_CANARY_RATIO, true, 1.0);
            return self.advance(tracker, MigrationState::GradualMigration);
        }

        let source_embedder = self
            .embedders
            .embedder_for(&tracker.source_model, tracker.source_dimension)?;
        let target_embedder = self
            .embedders
            .embedder_for(&tracker.target_model, tracker.target_dimension)?;

        // Seed the target with the re-embedded sample so the comparative
        // queries have something to retrieve. Gradual migration upserts the
        // same ids again later; last write wins, converging.
        for point in &sample {
            if let Err(err) = self.migrate_record(tracker, &target_embedder, point).await {
                warn!("canary: failed to seed sample record '{}': {err}", point.id);
            }
        }

        let mut source_tops: Vec<f64> = Vec::new();
        let mut target_tops: Vec<f64> = Vec::new();
        for point in &sample {
            let text = payload_text(&point.payload);
            if text.is_empty() {
                continue;
            }
            let source_vector = source_embedder.embed(&text).await?;
            let target_vector = target_embedder.embed(&text).await?;
            let source_hits = self
                .search(&tracker.source_collection, &source_vector, CANARY_QUERY_LIMIT)
                .await
                .map_err(|e| MemoryError::Collection(format!("canary source query: {e}")))?;
            let target_hits = self
                .search(&tracker.target_collection, &target_vector, CANARY_QUERY_LIMIT)
                .await
                .map_err(|e| MemoryError::Collection(format!("canary target query: {e}")))?;
            if let Some(hit) = source_hits.first() {
                source_tops.push(f64::from(hit.similarity));
            }
            if let Some(hit) = target_hits.first() {
                target_tops.push(f64::from(hit.similarity));
            }
        }

        let ratio = quality_ratio(&source_tops, &target_tops);
        let quality_threshold = tracker.migration_config.quality_threshold;
        let rollback_threshold = tracker.migration_config.rollback_threshold;
        info!(
            "canary quality ratio {ratio:.3} (advance >= {quality_threshold:.2}, \
             rollback < {rollback_threshold:.2})"
        );

        if ratio >= quality_threshold {
            tracker.record_gate(GATE_CANARY_RATIO, true, ratio);
            self.advance(tracker, MigrationState::GradualMigration)
        } else if ratio < rollback_threshold {
            tracker.record_gate(GATE_CANARY_RATIO, false, ratio);
            let reason = format!(
                "canary quality ratio {ratio:.3} below rollback threshold {rollback_threshold:.2}"
            );
            self.rollback(tracker, &reason)?;
            Ok(StepOutcome::RolledBack { reason })
        } else {
            // Between the thresholds: not good enough to advance, not bad
            // enough to abandon. Re-measure on the next step.
            tracker.record_gate(GATE_CANARY_RATIO, false, ratio);
            self.state_store.save(tracker)?;
            Ok(StepOutcome::InProgress(MigrationState::CanaryTesting))
        }
    }

    async fn step_gradual(&self, tracker: &mut MigrationStateTracker) -> Result<StepOutcome> {
        if !tracker.planned {
            let total = self
                .count(&tracker.source_collection)
                .await
                .map_err(|e| MemoryError::Collection(format!("cannot plan migration: {e}")))?;
            tracker.planned = true;
            tracker.total_count = total;
            tracker.migrated_count = 0;
            tracker.skipped_count = 0;
            tracker.update_progress();
            info!(
                "gradual migration planned: {total} records in batches of {}",
                tracker.migration_config.batch_size
            );
            self.state_store.save(tracker)?;
            return Ok(StepOutcome::InProgress(MigrationState::GradualMigration));
        }

        let offset = tracker.migrated_count + tracker.skipped_count;
        let batch_size = tracker.migration_config.batch_size.max(1);
        let batch = self
            .scroll(&tracker.source_collection, batch_size, offset)
            .await
            .map_err(|e| MemoryError::Collection(format!("batch scroll failed: {e}")))?;

        if batch.is_empty() {
            tracker.progress = 1.0;
            return self.advance(tracker, MigrationState::FullMigration);
        }

        let target_embedder = self
            .embedders
            .embedder_for(&tracker.target_model, tracker.target_dimension)?;

        let batch_len = batch.len();
        let mut failures = 0usize;
        for point in &batch {
            match self.migrate_record(tracker, &target_embedder, point).await {
                Ok(()) => tracker.migrated_count += 1,
                Err(err) => {
                    warn!("skipping record '{}' after retries: {err}", point.id);
                    failures += 1;
                    tracker.skipped_count += 1;
                }
            }
        }
        tracker.update_progress();

        let failure_rate = failures as f64 / batch_len as f64;
        if failure_rate > BATCH_FAILURE_TOLERANCE {
            return Err(MemoryError::Migration(format!(
                "batch failure rate {failure_rate:.2} exceeds tolerance {BATCH_FAILURE_TOLERANCE}"
            )));
        }

        debug!(
            "batch done: {}/{} migrated ({} skipped), progress {:.2}",
            tracker.migrated_count, tracker.total_count, tracker.skipped_count, tracker.progress
        );

        if tracker.migrated_count + tracker.skipped_count >= tracker.total_count {
            tracker.progress = 1.0;
            return self.advance(tracker, MigrationState::FullMigration);
        }

        self.state_store.save(tracker)?;
        let delay = tracker.migration_config.batch_delay_ms;
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        Ok(StepOutcome::InProgress(MigrationState::GradualMigration))
    }

    async fn step_full(&self, tracker: &mut MigrationStateTracker) -> Result<StepOutcome> {
        let window = tracker.migration_config.stability_window_secs;
        let elapsed = Utc::now()
            .signed_duration_since(tracker.state_entered_at)
            .num_seconds();
        if elapsed < i64::try_from(window).unwrap_or(i64::MAX) {
            info!(
                "full migration stable for {elapsed}s of required {window}s; not advancing yet"
            );
            return Ok(StepOutcome::InProgress(MigrationState::FullMigration));
        }

        // Cleanup entry action: the source collection is retained for
        // archival rather than deleted. Finalizing the state file completes
        // the migration; a failure to clear it is logged but does not revert
        // an otherwise finished migration.
        tracker.current_state = MigrationState::Cleanup;
        tracker.state_entered_at = Utc::now();
        tracker.record_gate(GATE_SOURCE_ARCHIVED, true, 1.0);
        info!(
            "migration complete: '{}' is primary; source '{}' retained for archival",
            tracker.target_collection, tracker.source_collection
        );
        if let Err(err) = self.state_store.clear() {
            warn!("cleanup: could not clear migration state file: {err}");
        }
        Ok(StepOutcome::Completed)
    }

    // -- Record processing --------------------------------------------------

    /// Re-embed one source record with the target model and upsert it into
    /// the target collection, retrying up to the configured per-record
    /// attempts.
    async fn migrate_record(
        &self,
        tracker: &MigrationStateTracker,
        embedder: &Arc<dyn Embedder>,
        point: &PointRecord,
    ) -> Result<()> {
        let text = payload_text(&point.payload);
        let mut payload = point.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("migrated_at".to_owned(), json!(Utc::now()));
        }

        let max_attempts = tracker.migration_config.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .try_migrate_once(&tracker.target_collection, &point.id, &text, &payload, embedder)
                .await
            {
                Ok(()) => return Ok(()),
                Err(ItemFailure::Fatal(msg)) => return Err(MemoryError::Migration(msg)),
                Err(ItemFailure::Retryable(msg)) => {
                    if attempt >= max_attempts {
                        return Err(MemoryError::Migration(format!(
                            "gave up after {attempt} attempts: {msg}"
                        )));
                    }
                    debug!("record '{}' attempt {attempt} failed: {msg}; retrying", point.id);
                    tokio::time::sleep(self.retry.backoff).await;
                }
            }
        }
    }

    async fn try_migrate_once(
        &self,
        target: &str,
        id: &str,
        text: &str,
        payload: &serde_json::Value,
        embedder: &Arc<dyn Embedder>,
    ) -> std::result::Result<(), ItemFailure> {
        let vector = embedder
            .embed(text)
            .await
            .map_err(|e| ItemFailure::Retryable(format!("re-embed failed: {e}")))?;
        let result = self
            .breakers
            .guard(target, || {
                self.store.upsert(target, id, vector, payload.clone())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => Err(ItemFailure::Retryable(err.to_string())),
            Err(err) => Err(ItemFailure::Fatal(err.to_string())),
        }
    }

    // -- Backend call helpers (breaker + bounded retry) ---------------------

    async fn guarded<T, F, Fut>(
        &self,
        collection: &str,
        what: &str,
        op: F,
    ) -> CollectionResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = CollectionResult<T>>,
    {
        self.retry
            .run(what, || self.breakers.guard(collection, &op))
            .await
    }

    async fn describe(&self, collection: &str) -> CollectionResult<CollectionInfo> {
        self.guarded(collection, "describe collection", || {
            self.store.describe(collection)
        })
        .await
    }

    async fn count(&self, collection: &str) -> CollectionResult<usize> {
        self.guarded(collection, "count collection", || {
            self.store.count(collection, None)
        })
        .await
    }

    async fn scroll(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> CollectionResult<Vec<PointRecord>> {
        self.guarded(collection, "scroll collection", || {
            self.store.scroll(collection, None, limit, offset)
        })
        .await
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
    ) -> CollectionResult<Vec<SearchHit>> {
        self.guarded(collection, "search collection", || {
            self.store.search(collection, query, limit, None)
        })
        .await
    }

    // -- State transitions --------------------------------------------------

    fn advance(
        &self,
        tracker: &mut MigrationStateTracker,
        next: MigrationState,
    ) -> Result<StepOutcome> {
        debug_assert!(
            tracker.current_state.can_transition_to(next),
            "invalid transition {} -> {next}",
            tracker.current_state
        );
        info!("migration state '{}' -> '{next}'", tracker.current_state);
        tracker.current_state = next;
        tracker.state_entered_at = Utc::now();
        self.state_store.save(tracker)?;
        Ok(StepOutcome::Advanced(next))
    }

    fn fail(&self, tracker: &mut MigrationStateTracker, reason: String) -> Result<StepOutcome> {
        warn!("migration failed in state '{}': {reason}", tracker.current_state);
        tracker.current_state = MigrationState::Failed;
        tracker.state_entered_at = Utc::now();
        tracker.failure_reason = Some(reason.clone());
        self.state_store.save(tracker)?;
        Ok(StepOutcome::Failed { reason })
    }
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("state_store", &self.state_store)
            .finish_non_exhaustive()
    }
}

/// Average target top-hit similarity over average source top-hit
/// similarity. With no measurable signal on the source side the canary has
/// nothing to compare against and does not block.
fn quality_ratio(source_tops: &[f64], target_tops: &[f64]) -> f64 {
    let avg = |values: &[f64]| -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    };
    let source_avg = avg(source_tops);
    if source_avg <= f64::EPSILON {
        return 1.0;
    }
    avg(target_tops) / source_avg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
