//! Dual-collection manager.
//!
//! The façade over the whole memory store. Owns the primary collection
//! handle, and — while a migration is running — the secondary (target)
//! collection handle too. Decides which collection(s) a read or write
//! touches depending on the migration phase, orchestrates the migration
//! engine, and reports status and health.
//!
//! Routing rules:
//! - Writes always go to the primary collection and must succeed there;
//!   from shadow mode until cleanup they are additionally mirrored to the
//!   target collection best-effort (a failed mirror write is logged, never
//!   surfaced to the caller).
//! - Reads search only the primary collection outside a migration; during
//!   one they search both collections and fuse the ranked lists. In full
//!   migration the target side becomes read-authoritative.
//!
//! One manager instance owns one memory store: migration state is an
//! explicit per-instance object, never process-global, so several stores
//! (e.g. in tests) cannot interfere with each other.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::{MigrationConfig, MnemoConfig};
use crate::error::{MemoryError, Result};
use crate::health::{
    HealthFinding, HealthReport, HealthStatus, breaker_findings, stale_migration_finding,
};
use crate::migration::engine::{MigrationEngine, StepOutcome};
use crate::migration::state::{
    MigrationState, MigrationStateTracker, MigrationStatus, StateStore,
};

use super::collection::{
    CollectionConfig, CollectionResult, CollectionStore, RetryPolicy, SearchHit,
};
use super::embedding::EmbedderProvider;
use super::fusion::{FusionEngine, FusionMetrics};
use super::types::{MemoryKind, MemoryRecord, MemorySearchHit, MemoryStats, MemoryTier, SearchFilter};

// ---------------------------------------------------------------------------
// Internal snapshots
// ---------------------------------------------------------------------------

/// The collection currently authoritative for reads and writes.
#[derive(Debug, Clone)]
struct PrimaryHandle {
    collection: String,
    model: String,
    dimension: usize,
}

/// Secondary collection handle, present while dual routing is active.
#[derive(Debug, Clone)]
struct TargetSpec {
    collection: String,
    model: String,
    dimension: usize,
}

/// Lock-free routing snapshot for the hot read/write paths.
///
/// Updated after every migration state change; reads and writes consult it
/// without touching the stepper's mutex, so a long-running batch step never
/// blocks a store or search call.
#[derive(Debug, Clone, Default)]
struct RouteSnapshot {
    state: Option<MigrationState>,
    target: Option<TargetSpec>,
}

impl RouteSnapshot {
    fn from_tracker(tracker: Option<&MigrationStateTracker>) -> Self {
        match tracker {
            Some(t) => Self {
                state: Some(t.current_state),
                target: Some(TargetSpec {
                    collection: t.target_collection.clone(),
                    model: t.target_model.clone(),
                    dimension: t.target_dimension,
                }),
            },
            None => Self::default(),
        }
    }

    fn dual_writes_active(&self) -> bool {
        self.state.is_some_and(MigrationState::dual_writes_active)
    }

    fn dual_reads_active(&self) -> bool {
        self.state.is_some_and(MigrationState::dual_reads_active)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Façade over the primary (and, during migration, secondary) collections.
pub struct DualCollectionManager {
    store: Arc<dyn CollectionStore>,
    embedders: Arc<dyn EmbedderProvider>,
    breakers: Arc<BreakerRegistry>,
    fusion: FusionEngine,
    retry: RetryPolicy,
    engine: MigrationEngine,
    default_min_similarity: f32,
    primary: RwLock<PrimaryHandle>,
    /// Single-writer migration state; the stepper holds this for the whole
    /// step, so concurrent `advance_migration` calls serialize here.
    migration: Mutex<Option<MigrationStateTracker>>,
    /// Routing snapshot for store/search, refreshed after each state change.
    route: RwLock<RouteSnapshot>,
    /// Status snapshot so `get_migration_status` never blocks on the stepper.
    status: RwLock<MigrationStatus>,
}

impl DualCollectionManager {
    /// Create a manager: ensures the primary collection exists and resumes a
    /// persisted migration if one was interrupted.
    ///
    /// # Errors
    ///
    /// Fails on an unknown primary embedding model, an unreachable backend,
    /// a conflicting existing collection, or a corrupt migration state file
    /// (which must be surfaced, not silently discarded).
    pub async fn new(
        store: Arc<dyn CollectionStore>,
        embedders: Arc<dyn EmbedderProvider>,
        config: &MnemoConfig,
    ) -> Result<Self> {
        let settings = &config.collection;
        // Resolve early: an unknown model is a configuration error, not
        // something to discover on the first write.
        embedders.embedder_for(&settings.embedding_model, settings.vector_dimension)?;

        let breakers = Arc::new(BreakerRegistry::new(config.breaker));
        let retry = RetryPolicy::from(config.retry);

        let collection_config = CollectionConfig {
            name: settings.name.clone(),
            vector_dimension: settings.vector_dimension,
            distance_metric: settings.distance_metric,
            embedding_model: settings.embedding_model.clone(),
        };
        retry
            .run("create primary collection", || {
                breakers.guard(&settings.name, || store.create_collection(&collection_config))
            })
            .await
            .map_err(|e| MemoryError::Collection(format!("cannot ensure primary collection: {e}")))?;

        let state_store = StateStore::new(config.migration_state_path());
        let mut resumed = state_store.load()?;
        match &resumed {
            Some(t) if t.current_state == MigrationState::Cleanup => {
                // Finished migration whose state file outlived the process;
                // nothing to resume.
                state_store.clear()?;
                resumed = None;
            }
            Some(t) => {
                info!(
                    "resuming migration '{}' -> '{}' in state '{}' ({:.0}% done)",
                    t.source_collection,
                    t.target_collection,
                    t.current_state,
                    t.progress * 100.0
                );
            }
            None => {}
        }

        let engine = MigrationEngine::new(
            store.clone(),
            embedders.clone(),
            breakers.clone(),
            state_store,
            retry,
        );

        let status = match &resumed {
            Some(t) => MigrationStatus::from_tracker(t),
            None => MigrationStatus::inactive(),
        };
        let route = RouteSnapshot::from_tracker(resumed.as_ref());

        Ok(Self {
            store,
            embedders,
            breakers,
            fusion: FusionEngine::new(config.fusion.rrf_k),
            retry,
            engine,
            default_min_similarity: settings.min_similarity,
            primary: RwLock::new(PrimaryHandle {
                collection: settings.name.clone(),
                model: settings.embedding_model.clone(),
                dimension: settings.vector_dimension,
            }),
            migration: Mutex::new(resumed),
            route: RwLock::new(route),
            status: RwLock::new(status),
        })
    }

    /// Name of the collection currently authoritative for reads and writes.
    pub fn primary_collection(&self) -> String {
        self.primary_handle().collection
    }

    // -- Writes -------------------------------------------------------------

    /// Store a memory record.
    ///
    /// The primary write must succeed for the call to succeed; during a
    /// migration the record is additionally mirrored to the target
    /// collection best-effort.
    ///
    /// # Errors
    ///
    /// Fails on content-contract violations, embedding failure, or a primary
    /// write that keeps failing after retries.
    pub async fn store_memory(&self, record: MemoryRecord) -> Result<String> {
        record.validate()?;
        let text = record.embedding_text();
        let payload = record.payload();

        let primary = self.primary_handle();
        let embedder = self.embedders.embedder_for(&primary.model, primary.dimension)?;
        let vector = embedder.embed(&text).await?;
        self.guarded_upsert(&primary.collection, &record.id, vector, payload.clone())
            .await
            .map_err(|e| MemoryError::Collection(format!("primary write failed: {e}")))?;

        let route = self.route_snapshot();
        if route.dual_writes_active() {
            if let Some(target) = &route.target {
                if let Err(err) = self.mirror_write(target, &record.id, &text, payload).await {
                    warn!(
                        "best-effort dual write of '{}' to '{}' failed: {err}",
                        record.id, target.collection
                    );
                }
            }
        }

        Ok(record.id)
    }

    async fn mirror_write(
        &self,
        target: &TargetSpec,
        id: &str,
        text: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let embedder = self.embedders.embedder_for(&target.model, target.dimension)?;
        let vector = embedder.embed(text).await?;
        self.guarded_upsert(&target.collection, id, vector, payload)
            .await
            .map_err(|e| MemoryError::Collection(e.to_string()))?;
        Ok(())
    }

    // -- Reads --------------------------------------------------------------

    /// Search memories by semantic similarity.
    ///
    /// Outside a migration this searches the primary collection only and the
    /// returned metrics are `None`. During a migration both collections are
    /// searched and fused; the secondary search is best-effort (its failure
    /// degrades to primary-only results).
    pub async fn search_memories(
        &self,
        query: &str,
        limit: usize,
        filter: Option<SearchFilter>,
    ) -> Result<(Vec<MemorySearchHit>, Option<FusionMetrics>)> {
        let mut filter = filter.unwrap_or_default();
        if filter.min_similarity.is_none() {
            filter.min_similarity = Some(self.default_min_similarity);
        }

        let primary = self.primary_handle();
        let embedder = self.embedders.embedder_for(&primary.model, primary.dimension)?;
        let vector = embedder.embed(query).await?;
        let primary_hits = self
            .guarded_search(&primary.collection, &vector, limit, &filter)
            .await
            .map_err(|e| MemoryError::Collection(format!("primary search failed: {e}")))?;

        let route = self.route_snapshot();
        if !route.dual_reads_active() {
            return Ok((hits_to_memories(primary_hits), None));
        }

        let secondary_hits = match &route.target {
            Some(target) => self.secondary_search(target, query, limit, &filter).await,
            None => Vec::new(),
        };

        // During full migration the target collection is authoritative for
        // reads (and therefore for content on duplicate ids).
        let (authoritative, fallback) = if route.state == Some(MigrationState::FullMigration) {
            (secondary_hits, primary_hits)
        } else {
            (primary_hits, secondary_hits)
        };
        let (fused, metrics) = self.fusion.fuse(&authoritative, &fallback, query, limit);
        Ok((hits_to_memories(fused), Some(metrics)))
    }

    async fn secondary_search(
        &self,
        target: &TargetSpec,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Vec<SearchHit> {
        let embedder = match self.embedders.embedder_for(&target.model, target.dimension) {
            Ok(embedder) => embedder,
            Err(err) => {
                warn!("secondary search skipped: {err}");
                return Vec::new();
            }
        };
        let vector = match embedder.embed(query).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!("secondary query embedding failed: {err}");
                return Vec::new();
            }
        };
        match self
            .guarded_search(&target.collection, &vector, limit, filter)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!("secondary search on '{}' failed: {err}", target.collection);
                Vec::new()
            }
        }
    }

    /// Aggregate counts from the primary collection.
    pub async fn memory_stats(&self) -> Result<MemoryStats> {
        let primary = self.primary_handle();
        let total = self
            .guarded_count(&primary.collection, None)
            .await
            .map_err(|e| MemoryError::Collection(e.to_string()))?;

        let mut stats = MemoryStats {
            total,
            ..MemoryStats::default()
        };
        for tier in MemoryTier::ALL {
            let filter = SearchFilter {
                tier: Some(tier),
                ..SearchFilter::default()
            };
            let count = self
                .guarded_count(&primary.collection, Some(&filter))
                .await
                .map_err(|e| MemoryError::Collection(e.to_string()))?;
            stats.by_tier.insert(tier.as_str().to_owned(), count);
        }
        for kind in MemoryKind::ALL {
            let filter = SearchFilter {
                kinds: Some(vec![kind]),
                ..SearchFilter::default()
            };
            let count = self
                .guarded_count(&primary.collection, Some(&filter))
                .await
                .map_err(|e| MemoryError::Collection(e.to_string()))?;
            stats.by_kind.insert(kind.as_str().to_owned(), count);
        }
        Ok(stats)
    }

    // -- Migration orchestration --------------------------------------------

    /// Current migration status. Never blocks on a running step and never
    /// fails; returns the `"inactive"` sentinel when nothing is running.
    pub fn get_migration_status(&self) -> MigrationStatus {
        self.status
            .read()
            .map(|status| status.clone())
            .unwrap_or_else(|_| MigrationStatus::inactive())
    }

    /// Start a migration to a new embedding model.
    ///
    /// Returns `Ok(false)` if a migration is already active — an expected
    /// caller-facing condition, not an error. A previous `failed` migration
    /// is replaced by the fresh one.
    ///
    /// # Errors
    ///
    /// Permanent configuration problems (unknown model, dimensionality
    /// contradiction, target identical to source) fail immediately.
    pub async fn start_migration(
        &self,
        target_model: &str,
        target_dimension: usize,
        migration_config: MigrationConfig,
    ) -> Result<bool> {
        let mut migration = self.migration.lock().await;
        if let Some(existing) = migration.as_ref() {
            if !existing.current_state.is_terminal() {
                info!(
                    "migration already active in state '{}', rejecting start",
                    existing.current_state
                );
                return Ok(false);
            }
        }

        // Surface configuration errors before any state is created.
        self.embedders.embedder_for(target_model, target_dimension)?;
        let primary = self.primary_handle();
        if primary.model == target_model && primary.dimension == target_dimension {
            return Err(MemoryError::Config(format!(
                "target model '{target_model}' ({target_dimension}d) is already the primary model"
            )));
        }

        let target_collection = format!("{}__{}", primary.collection, slug(target_model));
        let tracker = MigrationStateTracker::new(
            primary.collection.clone(),
            target_collection,
            primary.model.clone(),
            target_model,
            primary.dimension,
            target_dimension,
            migration_config,
        );
        self.engine.state_store().save(&tracker)?;
        info!(
            "migration started: '{}' ({}, {}d) -> '{}' ({}, {}d)",
            tracker.source_collection,
            tracker.source_model,
            tracker.source_dimension,
            tracker.target_collection,
            tracker.target_model,
            tracker.target_dimension
        );
        self.publish(Some(&tracker));
        *migration = Some(tracker);
        Ok(true)
    }

    /// Execute exactly one migration state-machine step.
    ///
    /// Returns `Ok(false)` when there is nothing to advance (no migration,
    /// or a terminal state). Step-internal failures transition the migration
    /// to `failed` and still return `Ok(true)` — the failure is visible in
    /// the status snapshot, not thrown at the caller.
    pub async fn advance_migration(&self) -> Result<bool> {
        let mut migration = self.migration.lock().await;
        let Some(tracker) = migration.as_mut() else {
            return Ok(false);
        };
        if tracker.current_state.is_terminal() {
            return Ok(false);
        }

        let outcome = self.engine.execute_step(tracker).await?;
        match outcome {
            StepOutcome::Completed => {
                self.promote_target(tracker);
                self.publish(None);
                *migration = None;
            }
            StepOutcome::RolledBack { reason } => {
                info!("migration rolled back: {reason}");
                self.publish(None);
                *migration = None;
            }
            StepOutcome::Advanced(_) | StepOutcome::InProgress(_) | StepOutcome::Failed { .. } => {
                self.publish(migration.as_ref());
            }
        }
        Ok(true)
    }

    /// Roll back any migration, leaving the store inactive with the source
    /// collection authoritative. Idempotent: rolling back when nothing is
    /// running is a successful no-op. The target collection's
    /// already-migrated data is never deleted.
    pub async fn rollback_migration(&self, reason: &str) -> Result<bool> {
        let mut migration = self.migration.lock().await;
        match migration.take() {
            Some(tracker) => self.engine.rollback(&tracker, reason)?,
            None => {
                info!("rollback requested with no active migration: {reason}");
                self.engine.state_store().clear()?;
            }
        }
        self.publish(None);
        Ok(true)
    }

    // -- Health -------------------------------------------------------------

    /// Health snapshot: migration phase and staleness plus breaker states.
    /// Never fails.
    pub fn health(&self) -> HealthReport {
        let mut findings = Vec::new();
        let status = self.get_migration_status();
        if !status.is_inactive() {
            if status.state == MigrationState::Failed.as_str() {
                findings.push(
                    HealthFinding::new(
                        "migration-failed",
                        HealthStatus::Unhealthy,
                        "embedding migration failed and needs a fresh start",
                    )
                    .with_evidence(status.failure_reason.clone().unwrap_or_default()),
                );
            } else {
                findings.push(HealthFinding::new(
                    "migration-active",
                    HealthStatus::Ok,
                    format!(
                        "migration in state '{}' ({:.0}% done)",
                        status.state,
                        status.progress * 100.0
                    ),
                ));
            }
            if let Some(started_at) = status.started_at {
                let budget = {
                    let migration = self.migration.try_lock();
                    match migration {
                        Ok(guard) => guard
                            .as_ref()
                            .map(|t| t.migration_config.max_time_hours),
                        Err(_) => None,
                    }
                };
                if let Some(max_hours) = budget {
                    findings.extend(stale_migration_finding(started_at, max_hours));
                }
            }
        }
        findings.extend(breaker_findings(&self.breakers.snapshot()));
        HealthReport::from_findings(findings)
    }

    // -- Internals ----------------------------------------------------------

    fn primary_handle(&self) -> PrimaryHandle {
        self.primary
            .read()
            .map(|handle| handle.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn route_snapshot(&self) -> RouteSnapshot {
        self.route
            .read()
            .map(|route| route.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Refresh the route and status snapshots from the tracker.
    fn publish(&self, tracker: Option<&MigrationStateTracker>) {
        if let Ok(mut route) = self.route.write() {
            *route = RouteSnapshot::from_tracker(tracker);
        }
        if let Ok(mut status) = self.status.write() {
            *status = match tracker {
                Some(t) => MigrationStatus::from_tracker(t),
                None => MigrationStatus::inactive(),
            };
        }
    }

    /// After cleanup the target collection becomes the primary.
    fn promote_target(&self, tracker: &MigrationStateTracker) {
        info!(
            "promoting '{}' ({}, {}d) to primary",
            tracker.target_collection, tracker.target_model, tracker.target_dimension
        );
        if let Ok(mut primary) = self.primary.write() {
            *primary = PrimaryHandle {
                collection: tracker.target_collection.clone(),
                model: tracker.target_model.clone(),
                dimension: tracker.target_dimension,
            };
        }
    }

    async fn guarded_upsert(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> CollectionResult<()> {
        self.retry
            .run("upsert", || {
                let vector = vector.clone();
                let payload = payload.clone();
                self.breakers.guard(collection, move || {
                    self.store.upsert(collection, id, vector, payload)
                })
            })
            .await
    }

    async fn guarded_search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
    ) -> CollectionResult<Vec<SearchHit>> {
        self.retry
            .run("search", || {
                self.breakers.guard(collection, || {
                    self.store.search(collection, vector, limit, Some(filter))
                })
            })
            .await
    }

    async fn guarded_count(
        &self,
        collection: &str,
        filter: Option<&SearchFilter>,
    ) -> CollectionResult<usize> {
        self.retry
            .run("count", || {
                self.breakers
                    .guard(collection, || self.store.count(collection, filter))
            })
            .await
    }
}

impl std::fmt::Debug for DualCollectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualCollectionManager")
            .field("primary", &self.primary_handle())
            .finish_non_exhaustive()
    }
}

/// Turn a model identifier into a collection-name-safe slug.
fn slug(model: &str) -> String {
    let mut out = String::with_capacity(model.len());
    for ch in model.chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_owned()
}

fn hits_to_memories(hits: Vec<SearchHit>) -> Vec<MemorySearchHit> {
    hits.into_iter()
        .filter_map(|hit| match MemoryRecord::from_payload(hit.payload) {
            Ok(record) => Some(MemorySearchHit {
                record,
                similarity: hit.similarity,
            }),
            Err(err) => {
                warn!("dropping unparseable search hit '{}': {err}", hit.id);
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
