//! Zero-downtime embedding-model migration.
//!
//! Sub-modules:
//! - `state`: the migration state machine's states, the durable
//!   [`MigrationStateTracker`](state::MigrationStateTracker), and its atomic
//!   JSON persistence.
//! - `engine`: the state machine driver — batch re-embedding, quality gates,
//!   transitions, rollback.

pub mod engine;
pub mod state;

pub use engine::{BATCH_FAILURE_TOLERANCE, MigrationEngine, StepOutcome};
pub use state::{
    MigrationState, MigrationStateTracker, MigrationStatus, QualityGate, StateStore,
};
