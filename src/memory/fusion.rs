//! Search result fusion across two collections.
//!
//! During a migration the primary and secondary collections hold vectors
//! from different embedding models, so their raw cosine scores are not
//! comparable. Fusion therefore uses Reciprocal Rank Fusion: each hit
//! contributes `1 / (k + rank)` per list it appears in, and only ranks —
//! never raw scores — decide the merged order.
//!
//! Deduplication is by id, and the primary collection is authoritative for
//! content: when the same id appears in both lists, the emitted payload (and
//! reported similarity) is the primary copy's, while the fused score still
//! gets both rank contributions.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use super::collection::SearchHit;

/// Per-query fusion diagnostics. Not persisted; returned alongside the fused
/// results for observability.
#[derive(Debug, Clone, Serialize)]
pub struct FusionMetrics {
    /// Fusion method name (`"rrf"`).
    pub fusion_method: &'static str,
    /// Wall-clock time spent fusing, in milliseconds.
    pub execution_time_ms: f64,
    /// Fused hits that appeared in the primary input list.
    pub primary_contributed: usize,
    /// Fused hits that appeared in the secondary input list.
    pub secondary_contributed: usize,
    /// avg(secondary similarity) / avg(primary similarity) over the input
    /// lists; `None` when either list is empty.
    pub quality_ratio: Option<f64>,
}

/// Reciprocal Rank Fusion engine.
#[derive(Debug, Clone)]
pub struct FusionEngine {
    k: f64,
}

impl FusionEngine {
    /// Create an engine with the given RRF constant (clamped to ≥ 1).
    pub fn new(k: f64) -> Self {
        Self { k: k.max(1.0) }
    }

    /// Merge two ranked result lists into one deduplicated, re-ranked list of
    /// at most `limit` hits.
    ///
    /// Either input list may be empty, in which case fusion degenerates to
    /// the other list (still deduplicated). A hit with a non-finite
    /// similarity keeps its list position but contributes the worst rank of
    /// its list to the fused score.
    pub fn fuse(
        &self,
        primary: &[SearchHit],
        secondary: &[SearchHit],
        query: &str,
        limit: usize,
    ) -> (Vec<SearchHit>, FusionMetrics) {
        let start = Instant::now();

        // id -> (fused score, hit to emit, primary rank for stable ordering)
        let mut fused: HashMap<&str, (f64, &SearchHit, usize)> = HashMap::new();

        for (rank, hit) in primary.iter().enumerate() {
            let score = self.contribution(rank, hit, primary.len());
            // Primary wins content: first occurrence per id is kept, and
            // primary is walked first.
            fused
                .entry(hit.id.as_str())
                .and_modify(|(s, _, _)| *s += score)
                .or_insert((score, hit, rank));
        }
        for (rank, hit) in secondary.iter().enumerate() {
            let score = self.contribution(rank, hit, secondary.len());
            fused
                .entry(hit.id.as_str())
                .and_modify(|(s, _, _)| *s += score)
                .or_insert((score, hit, usize::MAX));
        }

        let mut merged: Vec<(f64, usize, &SearchHit)> = fused
            .into_values()
            .map(|(score, hit, primary_rank)| (score, primary_rank, hit))
            .collect();
        // Fused score descending; ties broken by primary rank so the
        // authoritative ordering is stable.
        merged.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        merged.truncate(limit);
        let results: Vec<SearchHit> = merged.into_iter().map(|(_, _, hit)| hit.clone()).collect();

        let primary_ids: std::collections::HashSet<&str> =
            primary.iter().map(|h| h.id.as_str()).collect();
        let secondary_ids: std::collections::HashSet<&str> =
            secondary.iter().map(|h| h.id.as_str()).collect();
        let metrics = FusionMetrics {
            fusion_method: "rrf",
            execution_time_ms: start.elapsed().as_secs_f64() * 1_000.0,
            primary_contributed: results
                .iter()
                .filter(|h| primary_ids.contains(h.id.as_str()))
                .count(),
            secondary_contributed: results
                .iter()
                .filter(|h| secondary_ids.contains(h.id.as_str()))
                .count(),
            quality_ratio: quality_ratio(primary, secondary),
        };
        debug!(
            "fused {} + {} hits into {} for query '{query}' ({:.2}ms)",
            primary.len(),
            secondary.len(),
            results.len(),
            metrics.execution_time_ms
        );
        (results, metrics)
    }

    /// RRF contribution of one hit: `1 / (k + rank)`, 1-based rank.
    ///
    /// A non-finite similarity demotes the hit to its list's worst rank
    /// instead of failing the whole fusion.
    fn contribution(&self, rank: usize, hit: &SearchHit, list_len: usize) -> f64 {
        let effective_rank = if hit.similarity.is_finite() {
            rank + 1
        } else {
            list_len.max(1)
        };
        1.0 / (self.k + effective_rank as f64)
    }
}

/// avg(secondary similarity) / avg(primary similarity), ignoring non-finite
/// scores. `None` when either side has no finite scores.
fn quality_ratio(primary: &[SearchHit], secondary: &[SearchHit]) -> Option<f64> {
    let primary_avg = finite_avg(primary)?;
    let secondary_avg = finite_avg(secondary)?;
    if primary_avg <= f64::EPSILON {
        return None;
    }
    Some(secondary_avg / primary_avg)
}

fn finite_avg(hits: &[SearchHit]) -> Option<f64> {
    let finite: Vec<f64> = hits
        .iter()
        .filter(|h| h.similarity.is_finite())
        .map(|h| f64::from(h.similarity))
        .collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::DEFAULT_RRF_K;
    use serde_json::json;

    fn hit(id: &str, similarity: f32) -> SearchHit {
        SearchHit {
            id: id.to_owned(),
            payload: json!({"id": id}),
            similarity,
        }
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(DEFAULT_RRF_K)
    }

    #[test]
    fn both_empty_yields_empty() {
        let (results, metrics) = engine().fuse(&[], &[], "q", 5);
        assert!(results.is_empty());
        assert_eq!(metrics.primary_contributed, 0);
        assert_eq!(metrics.secondary_contributed, 0);
        assert!(metrics.quality_ratio.is_none());
    }

    #[test]
    fn empty_secondary_degenerates_to_primary() {
        let primary = vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7)];
        let (results, _) = engine().fuse(&primary, &[], "q", 5);
        let ids: Vec<&str> = results.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_primary_degenerates_to_secondary() {
        let secondary = vec![hit("x", 0.6), hit("y", 0.5)];
        let (results, _) = engine().fuse(&[], &secondary, "q", 5);
        let ids: Vec<&str> = results.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[test]
    fn no_duplicate_ids_in_output() {
        let primary = vec![hit("a", 0.9), hit("b", 0.8)];
        let secondary = vec![hit("a", 0.85), hit("c", 0.7)];
        let (results, _) = engine().fuse(&primary, &secondary, "q", 10);
        let mut ids: Vec<&str> = results.iter().map(|h| h.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), results.len());
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn output_respects_limit() {
        let primary = vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7)];
        let secondary = vec![hit("d", 0.6), hit("e", 0.5)];
        let (results, _) = engine().fuse(&primary, &secondary, "q", 2);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn dual_presence_outranks_single_presence() {
        // "both" is rank 2 in each list; "p1" and "s1" are rank 1 in one
        // list each. Two contributions beat one.
        let primary = vec![hit("p1", 0.9), hit("both", 0.8)];
        let secondary = vec![hit("s1", 0.9), hit("both", 0.85)];
        let (results, _) = engine().fuse(&primary, &secondary, "q", 10);
        assert_eq!(results[0].id, "both");
    }

    #[test]
    fn primary_payload_wins_for_duplicate_id() {
        let primary = vec![SearchHit {
            id: "m".to_owned(),
            payload: json!({"text": "original", "version": 1}),
            similarity: 0.7,
        }];
        let secondary = vec![SearchHit {
            id: "m".to_owned(),
            payload: json!({"text": "updated", "version": 2}),
            similarity: 0.95,
        }];
        let (results, _) = engine().fuse(&primary, &secondary, "q", 5);
        assert_eq!(results.len(), 1);
        // Primary is authoritative for content even with a lower similarity.
        assert_eq!(results[0].payload["version"], json!(1));
        assert!((results[0].similarity - 0.7).abs() < 1e-6);
    }

    #[test]
    fn identical_lists_deduplicate() {
        let list = vec![hit("a", 0.9)];
        let (results, _) = engine().fuse(&list, &list, "q", 5);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn non_finite_similarity_is_demoted_not_fatal() {
        let primary = vec![hit("bad", f32::NAN), hit("good", 0.8)];
        let secondary = vec![hit("other", 0.7)];
        let (results, _) = engine().fuse(&primary, &secondary, "q", 10);
        assert_eq!(results.len(), 3);
        // The NaN hit is demoted to worst rank: it must not be first.
        assert_ne!(results[0].id, "bad");
    }

    #[test]
    fn metrics_count_contributions_per_collection() {
        let primary = vec![hit("a", 0.9), hit("b", 0.8)];
        let secondary = vec![hit("b", 0.85), hit("c", 0.7)];
        let (results, metrics) = engine().fuse(&primary, &secondary, "q", 10);
        assert_eq!(results.len(), 3);
        assert_eq!(metrics.fusion_method, "rrf");
        assert_eq!(metrics.primary_contributed, 2); // a, b
        assert_eq!(metrics.secondary_contributed, 2); // b, c
    }

    #[test]
    fn quality_ratio_reflects_score_averages() {
        let primary = vec![hit("a", 0.8), hit("b", 0.8)];
        let secondary = vec![hit("c", 0.4), hit("d", 0.4)];
        let (_, metrics) = engine().fuse(&primary, &secondary, "q", 10);
        let ratio = metrics.quality_ratio.expect("ratio");
        assert!((ratio - 0.5).abs() < 1e-6);
    }

    #[test]
    fn large_input_fuses_quickly_and_respects_limit() {
        let primary: Vec<SearchHit> = (0..100)
            .map(|i| hit(&format!("p{i}"), 1.0 - i as f32 * 0.01))
            .collect();
        let secondary: Vec<SearchHit> = (0..100)
            .map(|i| hit(&format!("s{i}"), 0.9 - i as f32 * 0.01))
            .collect();
        let (results, metrics) = engine().fuse(&primary, &secondary, "load", 50);
        assert_eq!(results.len(), 50);
        assert!(metrics.execution_time_ms < 1_000.0);
    }
}
