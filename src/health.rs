//! Health reporting for the memory store.
//!
//! The manager assembles a [`HealthReport`] from findings about the running
//! migration (phase, staleness against the configured time budget) and the
//! backend circuit breakers. The report is a serializable snapshot intended
//! for an external health-check registry; producing it never fails.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::breaker::BreakerState;

/// Overall health classification, worst-of over all findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

/// A single health finding.
#[derive(Debug, Clone, Serialize)]
pub struct HealthFinding {
    /// Stable finding identifier (e.g. `migration-stale`).
    pub id: String,
    pub status: HealthStatus,
    pub summary: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl HealthFinding {
    pub fn new(
        id: impl Into<String>,
        status: HealthStatus,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            summary: summary.into(),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, line: impl Into<String>) -> Self {
        self.evidence.push(line.into());
        self
    }
}

/// Aggregated health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub findings: Vec<HealthFinding>,
}

impl HealthReport {
    /// Build a report from findings; overall status is the worst finding's,
    /// or `Ok` when there are none.
    pub fn from_findings(findings: Vec<HealthFinding>) -> Self {
        let status = findings
            .iter()
            .map(|f| f.status)
            .max()
            .unwrap_or(HealthStatus::Ok);
        Self {
            status,
            checked_at: Utc::now(),
            findings,
        }
    }
}

/// Finding for a migration running past its advisory time budget.
///
/// Returns `None` while the migration is within budget.
pub(crate) fn stale_migration_finding(
    started_at: DateTime<Utc>,
    max_time_hours: u64,
) -> Option<HealthFinding> {
    let elapsed = Utc::now().signed_duration_since(started_at);
    let budget_hours = i64::try_from(max_time_hours).unwrap_or(i64::MAX);
    if elapsed.num_hours() < budget_hours {
        return None;
    }
    Some(
        HealthFinding::new(
            "migration-stale",
            HealthStatus::Degraded,
            format!("migration has been running longer than {max_time_hours}h"),
        )
        .with_evidence(format!("started_at: {started_at}"))
        .with_evidence(format!("elapsed_hours: {}", elapsed.num_hours())),
    )
}

/// Findings for any non-closed circuit breaker.
pub(crate) fn breaker_findings(snapshot: &[(String, BreakerState)]) -> Vec<HealthFinding> {
    snapshot
        .iter()
        .filter(|(_, state)| *state != BreakerState::Closed)
        .map(|(name, state)| {
            HealthFinding::new(
                format!("breaker-{name}"),
                HealthStatus::Degraded,
                format!("circuit breaker for collection '{name}' is not closed"),
            )
            .with_evidence(format!("state: {state:?}"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
