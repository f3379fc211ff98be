//! Migration state tracking and persistence.
//!
//! [`MigrationStateTracker`] is the single source of truth for an in-flight
//! embedding-model migration. It is persisted as a JSON document after every
//! mutation — written atomically (temp file, fsync, rename) so a crash mid-
//! write never leaves a half-written state file — and reloaded on process
//! start so an interrupted migration resumes instead of silently losing
//! progress.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MigrationConfig;
use crate::error::{MemoryError, Result};

// ---------------------------------------------------------------------------
// State machine states
// ---------------------------------------------------------------------------

/// Phases of an embedding-model migration.
///
/// Transitions are linear (`Preparation → ShadowMode → CanaryTesting →
/// GradualMigration → FullMigration → Cleanup`); any state may transition to
/// `Failed`, and any non-terminal state may be rolled back to inactive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Preparation,
    ShadowMode,
    CanaryTesting,
    GradualMigration,
    FullMigration,
    Cleanup,
    Failed,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Preparation => "preparation",
            MigrationState::ShadowMode => "shadow_mode",
            MigrationState::CanaryTesting => "canary_testing",
            MigrationState::GradualMigration => "gradual_migration",
            MigrationState::FullMigration => "full_migration",
            MigrationState::Cleanup => "cleanup",
            MigrationState::Failed => "failed",
        }
    }

    /// Next state along the forward path, if any.
    pub fn next(self) -> Option<MigrationState> {
        match self {
            MigrationState::Preparation => Some(MigrationState::ShadowMode),
            MigrationState::ShadowMode => Some(MigrationState::CanaryTesting),
            MigrationState::CanaryTesting => Some(MigrationState::GradualMigration),
            MigrationState::GradualMigration => Some(MigrationState::FullMigration),
            MigrationState::FullMigration => Some(MigrationState::Cleanup),
            MigrationState::Cleanup | MigrationState::Failed => None,
        }
    }

    /// Terminal states cannot be advanced; a fresh `start_migration` is
    /// required to retry after `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Cleanup | MigrationState::Failed)
    }

    /// Whether new memories are written to both collections in this phase.
    pub fn dual_writes_active(self) -> bool {
        matches!(
            self,
            MigrationState::ShadowMode
                | MigrationState::CanaryTesting
                | MigrationState::GradualMigration
                | MigrationState::FullMigration
        )
    }

    /// Whether reads search both collections and fuse the results.
    pub fn dual_reads_active(self) -> bool {
        self.dual_writes_active()
    }

    /// Validates a forward transition (`Failed` is reachable from anywhere).
    pub fn can_transition_to(self, next: MigrationState) -> bool {
        next == MigrationState::Failed || self.next() == Some(next)
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Last measured outcome of a named quality gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGate {
    pub passed: bool,
    pub value: f64,
    pub measured_at: DateTime<Utc>,
}

impl QualityGate {
    pub fn new(passed: bool, value: f64) -> Self {
        Self {
            passed,
            value,
            measured_at: Utc::now(),
        }
    }
}

/// Durable record of an in-flight migration.
///
/// Passive data: mutated only by the migration engine under the manager's
/// single-writer lock, and persisted through [`StateStore`] after every
/// mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStateTracker {
    pub current_state: MigrationState,
    pub source_collection: String,
    pub target_collection: String,
    pub source_model: String,
    pub target_model: String,
    pub source_dimension: usize,
    pub target_dimension: usize,
    /// Fraction migrated, `migrated_and_skipped / total` of the planned
    /// snapshot.
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    /// When the current state was entered (stability-window bookkeeping).
    pub state_entered_at: DateTime<Utc>,
    pub quality_gates: BTreeMap<String, QualityGate>,
    pub migration_config: MigrationConfig,
    pub failure_reason: Option<String>,
    /// Whether the gradual-migration planner has snapshotted the source.
    #[serde(default)]
    pub planned: bool,
    /// Source record count at planning time.
    #[serde(default)]
    pub total_count: usize,
    /// Records successfully re-embedded into the target collection.
    #[serde(default)]
    pub migrated_count: usize,
    /// Records skipped after exhausting retries. Reported, never silently
    /// dropped.
    #[serde(default)]
    pub skipped_count: usize,
}

impl MigrationStateTracker {
    /// Create a tracker for a newly started migration, in `Preparation`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_collection: impl Into<String>,
        target_collection: impl Into<String>,
        source_model: impl Into<String>,
        target_model: impl Into<String>,
        source_dimension: usize,
        target_dimension: usize,
        migration_config: MigrationConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            current_state: MigrationState::Preparation,
            source_collection: source_collection.into(),
            target_collection: target_collection.into(),
            source_model: source_model.into(),
            target_model: target_model.into(),
            source_dimension,
            target_dimension,
            progress: 0.0,
            started_at: now,
            state_entered_at: now,
            quality_gates: BTreeMap::new(),
            migration_config,
            failure_reason: None,
            planned: false,
            total_count: 0,
            migrated_count: 0,
            skipped_count: 0,
        }
    }

    /// Record a quality gate measurement.
    pub fn record_gate(&mut self, name: &str, passed: bool, value: f64) {
        self.quality_gates
            .insert(name.to_owned(), QualityGate::new(passed, value));
    }

    /// Recompute `progress` from the planned snapshot.
    pub fn update_progress(&mut self) {
        self.progress = if self.total_count == 0 {
            if self.planned { 1.0 } else { 0.0 }
        } else {
            ((self.migrated_count + self.skipped_count) as f64 / self.total_count as f64).min(1.0)
        };
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Caller-facing migration status. Always coherent, always available — the
/// primary observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// State name, or `"inactive"` when no migration is running.
    pub state: String,
    pub progress: f64,
    pub source_collection: Option<String>,
    pub target_collection: Option<String>,
    pub source_model: Option<String>,
    pub target_model: Option<String>,
    pub target_dimension: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub quality_gates: BTreeMap<String, QualityGate>,
    pub total_count: usize,
    pub migrated_count: usize,
    pub skipped_count: usize,
    pub failure_reason: Option<String>,
}

impl MigrationStatus {
    /// Sentinel status when no migration is running.
    pub fn inactive() -> Self {
        Self {
            state: "inactive".to_owned(),
            progress: 0.0,
            source_collection: None,
            target_collection: None,
            source_model: None,
            target_model: None,
            target_dimension: None,
            started_at: None,
            quality_gates: BTreeMap::new(),
            total_count: 0,
            migrated_count: 0,
            skipped_count: 0,
            failure_reason: None,
        }
    }

    pub fn from_tracker(tracker: &MigrationStateTracker) -> Self {
        Self {
            state: tracker.current_state.as_str().to_owned(),
            progress: tracker.progress,
            source_collection: Some(tracker.source_collection.clone()),
            target_collection: Some(tracker.target_collection.clone()),
            source_model: Some(tracker.source_model.clone()),
            target_model: Some(tracker.target_model.clone()),
            target_dimension: Some(tracker.target_dimension),
            started_at: Some(tracker.started_at),
            quality_gates: tracker.quality_gates.clone(),
            total_count: tracker.total_count,
            migrated_count: tracker.migrated_count,
            skipped_count: tracker.skipped_count,
            failure_reason: tracker.failure_reason.clone(),
        }
    }

    pub fn is_inactive(&self) -> bool {
        self.state == "inactive"
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Atomic JSON persistence for the migration state tracker.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted tracker, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed —
    /// a corrupt state file must be surfaced, not treated as "no migration".
    pub fn load(&self) -> Result<Option<MigrationStateTracker>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(MemoryError::State(format!(
                    "cannot read migration state {}: {err}",
                    self.path.display()
                )));
            }
        };
        let tracker = serde_json::from_slice(&bytes).map_err(|err| {
            MemoryError::State(format!(
                "corrupt migration state {}: {err}",
                self.path.display()
            ))
        })?;
        Ok(Some(tracker))
    }

    /// Persist the tracker atomically: write a temp file in the same
    /// directory, fsync, then rename over the target path.
    pub fn save(&self, tracker: &MigrationStateTracker) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                MemoryError::State(format!(
                    "cannot create state directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(tracker)
            .map_err(|err| MemoryError::State(format!("cannot serialize migration state: {err}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp_path).map_err(|err| {
            MemoryError::State(format!(
                "cannot create state temp file {}: {err}",
                tmp_path.display()
            ))
        })?;
        file.write_all(json.as_bytes()).map_err(|err| {
            MemoryError::State(format!(
                "cannot write state temp file {}: {err}",
                tmp_path.display()
            ))
        })?;
        file.sync_all().map_err(|err| {
            MemoryError::State(format!(
                "cannot sync state temp file {}: {err}",
                tmp_path.display()
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|err| {
            MemoryError::State(format!(
                "cannot promote state temp file {} -> {}: {err}",
                tmp_path.display(),
                self.path.display()
            ))
        })?;
        Ok(())
    }

    /// Remove the persisted state. Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("cleared migration state {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MemoryError::State(format!(
                "cannot remove migration state {}: {err}",
                self.path.display()
            ))),
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

    fn tracker() -> MigrationStateTracker {
        MigrationStateTracker::new(
            "memories",
            "memories__bge-768",
            "all-minilm-l6-v2",
            "bge-base-en-v1-5",
            384,
            768,
            MigrationConfig::default(),
        )
    }

    #[test]
    fn states_advance_in_order() {
        let chain = [
            MigrationState::Preparation,
            MigrationState::ShadowMode,
            MigrationState::CanaryTesting,
            MigrationState::GradualMigration,
            MigrationState::FullMigration,
            MigrationState::Cleanup,
        ];
        for pair in chain.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert_eq!(MigrationState::Cleanup.next(), None);
        assert_eq!(MigrationState::Failed.next(), None);
    }

    #[test]
    fn no_skipped_or_backward_transitions() {
        assert!(!MigrationState::Preparation.can_transition_to(MigrationState::CanaryTesting));
        assert!(!MigrationState::GradualMigration.can_transition_to(MigrationState::ShadowMode));
        assert!(!MigrationState::Cleanup.can_transition_to(MigrationState::Preparation));
    }

    #[test]
    fn failed_is_reachable_from_anywhere() {
        for state in [
            MigrationState::Preparation,
            MigrationState::ShadowMode,
            MigrationState::CanaryTesting,
            MigrationState::GradualMigration,
            MigrationState::FullMigration,
            MigrationState::Cleanup,
        ] {
            assert!(state.can_transition_to(MigrationState::Failed));
        }
    }

    #[test]
    fn dual_writes_active_between_shadow_and_cleanup() {
        assert!(!MigrationState::Preparation.dual_writes_active());
        assert!(MigrationState::ShadowMode.dual_writes_active());
        assert!(MigrationState::CanaryTesting.dual_writes_active());
        assert!(MigrationState::GradualMigration.dual_writes_active());
        assert!(MigrationState::FullMigration.dual_writes_active());
        assert!(!MigrationState::Cleanup.dual_writes_active());
        assert!(!MigrationState::Failed.dual_writes_active());
    }

    #[test]
    fn state_serde_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&MigrationState::GradualMigration).unwrap(),
            r#""gradual_migration""#
        );
        let state: MigrationState = serde_json::from_str(r#""shadow_mode""#).unwrap();
        assert_eq!(state, MigrationState::ShadowMode);
    }

    #[test]
    fn progress_tracks_migrated_over_total() {
        let mut t = tracker();
        t.planned = true;
        t.total_count = 5;
        t.migrated_count = 4;
        t.update_progress();
        assert!((t.progress - 0.8).abs() < 1e-9);

        t.migrated_count = 5;
        t.update_progress();
        assert!((t.progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn progress_with_empty_source_is_complete_once_planned() {
        let mut t = tracker();
        t.update_progress();
        assert!((t.progress - 0.0).abs() < 1e-9);
        t.planned = true;
        t.update_progress();
        assert!((t.progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn skipped_records_count_toward_progress() {
        let mut t = tracker();
        t.planned = true;
        t.total_count = 4;
        t.migrated_count = 3;
        t.skipped_count = 1;
        t.update_progress();
        assert!((t.progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn status_inactive_sentinel() {
        let status = MigrationStatus::inactive();
        assert_eq!(status.state, "inactive");
        assert!(status.is_inactive());
    }

    #[test]
    fn status_snapshot_mirrors_tracker() {
        let mut t = tracker();
        t.record_gate("canary_quality_ratio", true, 0.91);
        let status = MigrationStatus::from_tracker(&t);
        assert_eq!(status.state, "preparation");
        assert_eq!(status.target_dimension, Some(768));
        assert!(status.quality_gates["canary_quality_ratio"].passed);
    }

    #[test]
    fn persisted_state_matches_wire_shape() {
        let mut t = tracker();
        t.current_state = MigrationState::GradualMigration;
        t.record_gate("canary_quality_ratio", true, 0.81);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["current_state"], "gradual_migration");
        assert_eq!(json["target_dimension"], 768);
        assert!(json["migration_config"]["batch_size"].is_number());
        assert!(json["started_at"].is_string());
        assert_eq!(json["failure_reason"], serde_json::Value::Null);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path().join("migration-state.json"));

        assert!(store.load().expect("load empty").is_none());

        let mut t = tracker();
        t.current_state = MigrationState::CanaryTesting;
        t.migrated_count = 3;
        store.save(&t).expect("save");

        let loaded = store.load().expect("load").expect("some tracker");
        assert_eq!(loaded.current_state, MigrationState::CanaryTesting);
        assert_eq!(loaded.migrated_count, 3);
        assert_eq!(loaded.source_collection, "memories");
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path().join("nested/deeper/state.json"));
        store.save(&tracker()).expect("save with nested parents");
        assert!(store.load().expect("load").is_some());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&tracker()).expect("save");
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_owned()]);
    }

    #[test]
    fn corrupt_state_file_is_an_error_not_none() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").expect("write garbage");
        let err = StateStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = StateStore::new(dir.path().join("state.json"));
        store.clear().expect("clear missing file");
        store.save(&tracker()).expect("save");
        store.clear().expect("clear existing");
        assert!(store.load().expect("load").is_none());
    }
}
