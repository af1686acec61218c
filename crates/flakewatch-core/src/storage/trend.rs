use super::store::{outcome_from_sql, Store};
use super::{from_millis, window_start};
use crate::errors::StorageError;
use crate::model::{pass_rate, Outcome};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "test_identity", rename_all = "snake_case")]
pub enum TrendScope {
    Global,
    Test(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
    pub pass_rate: Option<f64>,
    /// Sum of test durations in the run (global) or the test's own duration.
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
struct TrendRow {
    run_id: String,
    started_at_ms: i64,
    passed: u32,
    failed: u32,
    skipped: u32,
    errors: u32,
    duration_ms: i64,
}

/// Per-run points in run-start order. Rows are read once; points are built
/// on every `iter()` so the series can be walked any number of times.
#[derive(Debug, Clone)]
pub struct TrendSeries {
    scope: TrendScope,
    window_days: u32,
    rows: Vec<TrendRow>,
}

impl TrendSeries {
    pub fn scope(&self) -> &TrendScope {
        &self.scope
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TrendPoint> + '_ {
        self.rows.iter().map(|r| TrendPoint {
            run_id: r.run_id.clone(),
            started_at: from_millis(r.started_at_ms),
            passed: r.passed,
            failed: r.failed,
            skipped: r.skipped,
            errors: r.errors,
            pass_rate: pass_rate(r.passed, r.failed, r.errors),
            duration_ms: r.duration_ms.max(0) as u64,
        })
    }

    pub fn points(&self) -> Vec<TrendPoint> {
        self.iter().collect()
    }
}

impl Store {
    pub fn query_trend(&self, scope: TrendScope, window_days: u32) -> Result<TrendSeries, StorageError> {
        let since = window_start(window_days);
        let conn = self.lock()?;
        let mut rows = Vec::new();

        match &scope {
            TrendScope::Global => {
                let mut stmt = conn.prepare(
                    "SELECT r.run_id, r.started_at, r.passed, r.failed, r.skipped, r.errors,
                            COALESCE((SELECT SUM(t.duration_ms) FROM test_results t WHERE t.run_id = r.run_id), 0)
                     FROM test_runs r
                     WHERE r.started_at >= ?1
                     ORDER BY r.started_at ASC, r.run_id ASC",
                )?;
                let mapped = stmt.query_map(params![since], |row| {
                    Ok(TrendRow {
                        run_id: row.get(0)?,
                        started_at_ms: row.get(1)?,
                        passed: row.get(2)?,
                        failed: row.get(3)?,
                        skipped: row.get(4)?,
                        errors: row.get(5)?,
                        duration_ms: row.get(6)?,
                    })
                })?;
                for r in mapped {
                    rows.push(r?);
                }
            }
            TrendScope::Test(identity) => {
                let mut stmt = conn.prepare(
                    "SELECT r.run_id, r.started_at, t.outcome, t.duration_ms
                     FROM test_results t
                     JOIN test_runs r ON r.run_id = t.run_id
                     WHERE t.test_identity = ?1 AND r.started_at >= ?2
                     ORDER BY r.started_at ASC, r.run_id ASC",
                )?;
                let mapped = stmt.query_map(params![identity, since], |row| {
                    let outcome: String = row.get(2)?;
                    let outcome = outcome_from_sql(2, &outcome)?;
                    let one = |o: Outcome| u32::from(outcome == o);
                    Ok(TrendRow {
                        run_id: row.get(0)?,
                        started_at_ms: row.get(1)?,
                        passed: one(Outcome::Passed),
                        failed: one(Outcome::Failed),
                        skipped: one(Outcome::Skipped),
                        errors: one(Outcome::Error),
                        duration_ms: row.get(3)?,
                    })
                })?;
                for r in mapped {
                    rows.push(r?);
                }
            }
        }

        Ok(TrendSeries {
            scope,
            window_days,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunCounts, RunMetadata, TestResult, TestRun};
    use chrono::Duration;

    fn record(store: &Store, run_id: &str, age: Duration, outcomes: &[(&str, Outcome, u64)]) {
        let started_at = Utc::now() - age;
        let results: Vec<TestResult> = outcomes
            .iter()
            .map(|(id, o, d)| TestResult {
                run_id: run_id.into(),
                test_identity: id.to_string(),
                outcome: *o,
                duration_ms: *d,
                error: None,
            })
            .collect();
        let run = TestRun {
            run_id: run_id.into(),
            started_at,
            finished_at: started_at + Duration::seconds(1),
            counts: RunCounts::from_outcomes(outcomes.iter().map(|(_, o, _)| o)),
            metadata: RunMetadata::default(),
        };
        store.record_run(&run, &results).unwrap();
    }

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    #[test]
    fn test_global_trend_orders_by_start_and_is_restartable() {
        let s = store();
        record(&s, "later", Duration::hours(1), &[("a", Outcome::Passed, 5)]);
        record(
            &s,
            "earlier",
            Duration::hours(3),
            &[("a", Outcome::Failed, 7), ("b", Outcome::Passed, 3)],
        );
        record(&s, "ancient", Duration::days(10), &[("a", Outcome::Passed, 1)]);

        let series = s.query_trend(TrendScope::Global, 1).unwrap();
        let first: Vec<_> = series.iter().map(|p| p.run_id).collect();
        let second: Vec<_> = series.iter().map(|p| p.run_id).collect();
        assert_eq!(first, vec!["earlier", "later"]);
        assert_eq!(first, second);

        let p = &series.points()[0];
        assert_eq!(p.duration_ms, 10);
        assert_eq!(p.pass_rate, Some(0.5));
    }

    #[test]
    fn test_per_test_trend() {
        let s = store();
        record(&s, "r1", Duration::hours(2), &[("a", Outcome::Skipped, 0), ("b", Outcome::Passed, 1)]);
        record(&s, "r2", Duration::hours(1), &[("a", Outcome::Error, 4)]);

        let series = s.query_trend(TrendScope::Test("a".into()), 7).unwrap();
        let pts = series.points();
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0].skipped, 1);
        assert_eq!(pts[0].pass_rate, None);
        assert_eq!(pts[1].errors, 1);
        assert_eq!(pts[1].pass_rate, Some(0.0));
    }

    #[test]
    fn test_empty_window_and_unknown_identity() {
        let s = store();
        assert!(s.query_trend(TrendScope::Global, 30).unwrap().is_empty());
        record(&s, "r1", Duration::hours(2), &[("a", Outcome::Passed, 1)]);
        assert!(s.query_trend(TrendScope::Global, 0).unwrap().is_empty());
        let unknown = s.query_trend(TrendScope::Test("nope".into()), 30).unwrap();
        assert_eq!(unknown.iter().count(), 0);
    }
}
