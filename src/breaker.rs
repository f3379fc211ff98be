//! Circuit breakers for collection-store calls.
//!
//! Each collection gets an independent breaker. Repeated transient failures
//! open the breaker; while open, calls fail fast instead of hammering a dead
//! backend. After a cooldown the breaker goes half-open and lets one probe
//! call through: success closes it, failure re-opens it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::memory::collection::{CollectionError, CollectionResult};

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// Error returned when a breaker rejects a call.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{name}' is open; retry after {retry_after_secs}s")]
pub struct BreakerOpen {
    pub name: String,
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct Breaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    fn check(&mut self, name: &str) -> Result<(), BreakerOpen> {
        if self.state != BreakerState::Open {
            return Ok(());
        }
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(cooldown);
        if elapsed >= cooldown {
            info!("breaker '{name}' half-open after cooldown");
            self.state = BreakerState::HalfOpen;
            return Ok(());
        }
        Err(BreakerOpen {
            name: name.to_owned(),
            retry_after_secs: cooldown.saturating_sub(elapsed).as_secs().max(1),
        })
    }

    fn record_success(&mut self, name: &str) {
        if self.state != BreakerState::Closed {
            info!("breaker '{name}' closed after successful probe");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, name: &str) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let tripped = self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= self.config.failure_threshold;
        if tripped && self.state != BreakerState::Open {
            warn!(
                "breaker '{name}' opened after {} consecutive failures",
                self.consecutive_failures
            );
        }
        if tripped {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
        }
    }
}

/// Registry of per-collection breakers.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a call to `name` may proceed.
    pub fn check(&self, name: &str) -> Result<(), BreakerOpen> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            // A poisoned lock must not take the store down; let the call
            // proceed unguarded.
            Err(_) => return Ok(()),
        };
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| Breaker::new(self.config))
            .check(name)
    }

    pub fn record_success(&self, name: &str) {
        if let Ok(mut breakers) = self.breakers.lock() {
            breakers
                .entry(name.to_owned())
                .or_insert_with(|| Breaker::new(self.config))
                .record_success(name);
        }
    }

    pub fn record_failure(&self, name: &str) {
        if let Ok(mut breakers) = self.breakers.lock() {
            breakers
                .entry(name.to_owned())
                .or_insert_with(|| Breaker::new(self.config))
                .record_failure(name);
        }
    }

    /// Run a backend call under the named breaker.
    ///
    /// An open breaker surfaces as a transient [`CollectionError`] so callers
    /// degrade the same way they do for any other transient backend failure.
    /// Only transient errors count against the breaker.
    pub async fn guard<T, F, Fut>(&self, name: &str, op: F) -> CollectionResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CollectionResult<T>>,
    {
        if let Err(open) = self.check(name) {
            return Err(CollectionError::Transient(open.to_string()));
        }
        match op().await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() {
                    self.record_failure(name);
                }
                Err(err)
            }
        }
    }

    /// Current state of every known breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let mut snapshot: Vec<(String, BreakerState)> = match self.breakers.lock() {
            Ok(breakers) => breakers
                .iter()
                .map(|(name, b)| (name.clone(), b.state))
                .collect(),
            Err(_) => Vec::new(),
        };
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn registry(threshold: u32, cooldown_secs: u64) -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown_secs,
        })
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let registry = registry(3, 60);
        for _ in 0..2 {
            registry.record_failure("memories");
            assert!(registry.check("memories").is_ok());
        }
        registry.record_failure("memories");
        let err = registry.check("memories").unwrap_err();
        assert_eq!(err.name, "memories");
        assert!(err.retry_after_secs >= 1);
    }

    #[test]
    fn success_resets_failure_count() {
        let registry = registry(3, 60);
        registry.record_failure("memories");
        registry.record_failure("memories");
        registry.record_success("memories");
        registry.record_failure("memories");
        registry.record_failure("memories");
        // Two failures after the reset: still closed.
        assert!(registry.check("memories").is_ok());
    }

    #[test]
    fn breaker_goes_half_open_after_cooldown() {
        let registry = registry(1, 0);
        registry.record_failure("memories");
        // Zero cooldown: immediately half-open, probe allowed.
        assert!(registry.check("memories").is_ok());
        assert_eq!(registry.snapshot()[0].1, BreakerState::HalfOpen);
        // Probe failure re-opens immediately.
        registry.record_failure("memories");
        registry.record_success("memories");
        assert_eq!(registry.snapshot()[0].1, BreakerState::Closed);
    }

    #[test]
    fn breakers_are_independent_per_collection() {
        let registry = registry(1, 60);
        registry.record_failure("memories");
        assert!(registry.check("memories").is_err());
        assert!(registry.check("memories_target").is_ok());
    }

    #[tokio::test]
    async fn guard_passes_through_success() {
        let registry = registry(3, 60);
        let result = registry
            .guard("memories", || async { Ok::<_, CollectionError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn guard_counts_transient_failures_and_opens() {
        let registry = registry(2, 60);
        for _ in 0..2 {
            let result: CollectionResult<()> = registry
                .guard("memories", || async {
                    Err(CollectionError::Transient("down".into()))
                })
                .await;
            assert!(result.is_err());
        }
        // Breaker is now open: the op must not run.
        let result: CollectionResult<()> = registry
            .guard("memories", || async {
                panic!("op must not run while breaker is open")
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("breaker"));
    }

    #[tokio::test]
    async fn guard_ignores_permanent_errors_for_breaker_state() {
        let registry = registry(1, 60);
        let result: CollectionResult<()> = registry
            .guard("memories", || async {
                Err(CollectionError::NotFound("memories".into()))
            })
            .await;
        assert!(result.is_err());
        // Permanent failure did not trip the breaker.
        assert!(registry.check("memories").is_ok());
    }
}
