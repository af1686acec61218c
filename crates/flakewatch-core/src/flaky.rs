//! Flip-rate flakiness scoring over a test's run-ordered outcome history.
//!
//! Adjacency is run order, not wall-clock distance: two runs a month apart
//! are neighbours if nothing ran in between.

use crate::errors::{InsufficientData, StorageError};
use crate::model::Outcome;
use crate::storage::{HistoryRevision, Store, TrendSummary};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;

pub const DEFAULT_MIN_OBSERVATIONS: usize = 5;
pub const DEFAULT_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlakyRecord {
    pub test_identity: String,
    pub flip_count: usize,
    pub total_observations: usize,
    pub pass_count: usize,
    pub fail_count: usize,
    pub instability_score: f64,
    pub is_flaky: bool,
    pub last_computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum FlakyVerdict {
    Record(FlakyRecord),
    InsufficientData { observed: usize, required: usize },
}

impl FlakyVerdict {
    pub fn record(&self) -> Option<&FlakyRecord> {
        match self {
            FlakyVerdict::Record(r) => Some(r),
            FlakyVerdict::InsufficientData { .. } => None,
        }
    }

    pub fn is_flaky(&self) -> bool {
        self.record().is_some_and(|r| r.is_flaky)
    }

    pub fn into_result(self) -> Result<FlakyRecord, InsufficientData> {
        match self {
            FlakyVerdict::Record(r) => Ok(r),
            FlakyVerdict::InsufficientData { observed, required } => {
                Err(InsufficientData { observed, required })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceStats {
    pub flip_count: usize,
    pub total_observations: usize,
    pub pass_count: usize,
    pub fail_count: usize,
}

impl SequenceStats {
    pub fn instability_score(&self) -> f64 {
        if self.total_observations < 2 {
            0.0
        } else {
            self.flip_count as f64 / (self.total_observations - 1) as f64
        }
    }
}

/// Skipped outcomes are dropped before counting; failed and error both count as a failure.
pub fn analyze_sequence(outcomes: &[Outcome]) -> SequenceStats {
    let mut stats = SequenceStats::default();
    let mut prev: Option<bool> = None;
    for passed in outcomes.iter().filter_map(|o| match o {
        Outcome::Passed => Some(true),
        Outcome::Failed | Outcome::Error => Some(false),
        Outcome::Skipped => None,
    }) {
        stats.total_observations += 1;
        if passed {
            stats.pass_count += 1;
        } else {
            stats.fail_count += 1;
        }
        if prev.is_some_and(|p| p != passed) {
            stats.flip_count += 1;
        }
        prev = Some(passed);
    }
    stats
}

#[derive(Debug, Clone)]
struct CachedStats {
    revision: HistoryRevision,
    stats: SequenceStats,
    computed_at: DateTime<Utc>,
}

pub struct FlakyDetector {
    store: Store,
    min_observations: usize,
    threshold: f64,
    cache: Cache<String, CachedStats>,
}

impl FlakyDetector {
    pub fn new(store: Store, min_observations: usize, threshold: f64) -> Self {
        Self {
            store,
            min_observations,
            threshold,
            cache: Cache::new(10_000),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn detect(&self, test_identity: &str) -> Result<FlakyVerdict, StorageError> {
        self.detect_flaky(test_identity, self.min_observations)
    }

    /// Recomputes only when the identity's history revision moved since the cached result.
    pub fn detect_flaky(
        &self,
        test_identity: &str,
        min_observations: usize,
    ) -> Result<FlakyVerdict, StorageError> {
        let revision = self.store.history_revision(test_identity)?;
        let cached = match self.cache.get(test_identity) {
            Some(hit) if hit.revision == revision => hit,
            _ => {
                let outcomes = self.store.outcome_sequence(test_identity)?;
                let fresh = CachedStats {
                    revision,
                    stats: analyze_sequence(&outcomes),
                    computed_at: Utc::now(),
                };
                tracing::debug!(
                    event = "flaky_recomputed",
                    test = %test_identity,
                    observations = fresh.stats.total_observations
                );
                self.cache.insert(test_identity.to_string(), fresh.clone());
                fresh
            }
        };

        let stats = cached.stats;
        if stats.total_observations < min_observations {
            return Ok(FlakyVerdict::InsufficientData {
                observed: stats.total_observations,
                required: min_observations,
            });
        }
        let score = stats.instability_score();
        Ok(FlakyVerdict::Record(FlakyRecord {
            test_identity: test_identity.to_string(),
            flip_count: stats.flip_count,
            total_observations: stats.total_observations,
            pass_count: stats.pass_count,
            fail_count: stats.fail_count,
            instability_score: score,
            is_flaky: score >= self.threshold,
            last_computed_at: cached.computed_at,
        }))
    }

    /// Flaky tests among identities that ran in the window, highest score first.
    pub fn flaky_tests(&self, window_days: u32) -> Result<Vec<FlakyRecord>, StorageError> {
        let mut out = Vec::new();
        for identity in self.store.identities_in_window(window_days)? {
            if let FlakyVerdict::Record(r) = self.detect(&identity)? {
                if r.is_flaky {
                    out.push(r);
                }
            }
        }
        out.sort_by(|a, b| {
            b.instability_score
                .total_cmp(&a.instability_score)
                .then_with(|| a.test_identity.cmp(&b.test_identity))
        });
        Ok(out)
    }

    pub fn trend_summary(&self, days: u32) -> Result<TrendSummary, StorageError> {
        let mut summary = self.store.trend_summary(days)?;
        summary.flaky_tests = Some(self.flaky_tests(days)?.len());
        Ok(summary)
    }
}
