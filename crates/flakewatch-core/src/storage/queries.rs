use super::store::{error_from_row, outcome_from_sql, Store};
use super::{from_millis, window_start};
use crate::errors::StorageError;
use crate::model::{pass_rate, ClassifiedError, Outcome};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRank {
    pub test_identity: String,
    pub failures: u64,
    pub observations: u64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowRank {
    pub test_identity: String,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
    pub observations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_runs: u64,
    pub total_results: u64,
    pub average_pass_rate: Option<f64>,
    pub most_failed: Vec<FailureRank>,
    pub slowest: Vec<SlowRank>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub window_days: u32,
    pub runs_in_window: u64,
    pub pass_rate: Option<f64>,
    pub previous_pass_rate: Option<f64>,
    pub pass_rate_change: Option<f64>,
    pub avg_duration_ms: Option<f64>,
    /// Filled in by the flaky detector; the store has no notion of flakiness.
    pub flaky_tests: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub error: Option<ClassifiedError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: u64,
}

/// (row count, max row id) of an identity's results. Changes on every write
/// touching the identity and on purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HistoryRevision {
    pub count: u64,
    pub max_id: i64,
}

impl Store {
    pub fn query_most_failed(&self, limit: u32) -> Result<Vec<FailureRank>, StorageError> {
        let since = window_start(self.recency_window_days());
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.test_identity,
                    SUM(CASE WHEN t.outcome IN ('failed', 'error') THEN 1 ELSE 0 END) AS failures,
                    SUM(CASE WHEN t.outcome != 'skipped' THEN 1 ELSE 0 END) AS observed
             FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE r.started_at >= ?1
             GROUP BY t.test_identity
             HAVING failures > 0
             ORDER BY failures DESC, t.test_identity ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit], |row| {
            let failures: i64 = row.get(1)?;
            let observed: i64 = row.get(2)?;
            Ok(FailureRank {
                test_identity: row.get(0)?,
                failures: failures as u64,
                observations: observed as u64,
                failure_rate: if observed > 0 {
                    failures as f64 / observed as f64
                } else {
                    0.0
                },
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Skipped executions are excluded from duration statistics.
    pub fn query_slowest(&self, limit: u32) -> Result<Vec<SlowRank>, StorageError> {
        let since = window_start(self.recency_window_days());
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.test_identity, AVG(t.duration_ms), MAX(t.duration_ms), COUNT(*)
             FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE r.started_at >= ?1 AND t.outcome != 'skipped'
             GROUP BY t.test_identity
             ORDER BY AVG(t.duration_ms) DESC, t.test_identity ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, limit], |row| {
            let max: i64 = row.get(2)?;
            let n: i64 = row.get(3)?;
            Ok(SlowRank {
                test_identity: row.get(0)?,
                avg_duration_ms: row.get(1)?,
                max_duration_ms: max.max(0) as u64,
                observations: n as u64,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn statistics(&self, limit: u32) -> Result<HistoryStats, StorageError> {
        let (total_runs, total_results, passed, judged) = {
            let conn = self.lock()?;
            let (runs, passed, judged): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(passed), 0), COALESCE(SUM(passed + failed + errors), 0) FROM test_runs",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;
            let results: i64 =
                conn.query_row("SELECT COUNT(*) FROM test_results", [], |r| r.get(0))?;
            (runs, results, passed, judged)
        };

        Ok(HistoryStats {
            total_runs: total_runs as u64,
            total_results: total_results as u64,
            average_pass_rate: ratio(passed, judged),
            most_failed: self.query_most_failed(limit)?,
            slowest: self.query_slowest(limit)?,
        })
    }

    /// Compares the last `days` against the `days` before them.
    pub fn trend_summary(&self, days: u32) -> Result<TrendSummary, StorageError> {
        let recent_start = window_start(days);
        let previous_start = window_start(days.saturating_mul(2));
        let conn = self.lock()?;

        let aggregate = |from: i64, to: Option<i64>| -> Result<(i64, i64, i64), StorageError> {
            let to = to.unwrap_or(i64::MAX);
            Ok(conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(passed), 0), COALESCE(SUM(passed + failed + errors), 0)
                 FROM test_runs WHERE started_at >= ?1 AND started_at < ?2",
                params![from, to],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?)
        };

        let (runs, passed, judged) = aggregate(recent_start, None)?;
        let (prev_runs, prev_passed, prev_judged) = aggregate(previous_start, Some(recent_start))?;

        let avg_duration_ms: Option<f64> = conn.query_row(
            "SELECT AVG(t.duration_ms) FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE r.started_at >= ?1 AND t.outcome != 'skipped'",
            params![recent_start],
            |r| r.get(0),
        )?;

        let pass_rate = ratio(passed, judged);
        let previous_pass_rate = if prev_runs > 0 {
            ratio(prev_passed, prev_judged)
        } else {
            None
        };
        Ok(TrendSummary {
            window_days: days,
            runs_in_window: runs as u64,
            pass_rate,
            previous_pass_rate,
            pass_rate_change: pass_rate.zip(previous_pass_rate).map(|(now, before)| now - before),
            avg_duration_ms,
            flaky_tests: None,
        })
    }

    /// Newest executions first.
    pub fn test_history(&self, test_identity: &str, limit: u32) -> Result<Vec<HistoryEntry>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT r.run_id, r.started_at, t.outcome, t.duration_ms,
                    t.error_category, t.error_severity, t.error_hash, t.error_message
             FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE t.test_identity = ?1
             ORDER BY r.started_at DESC, r.run_id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![test_identity, limit], |row| {
            let outcome: String = row.get(2)?;
            let duration: i64 = row.get(3)?;
            Ok(HistoryEntry {
                run_id: row.get(0)?,
                started_at: from_millis(row.get(1)?),
                outcome: outcome_from_sql(2, &outcome)?,
                duration_ms: duration.max(0) as u64,
                error: error_from_row(row, 4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn error_breakdown(&self, window_days: u32) -> Result<Vec<CategoryCount>, StorageError> {
        let since = window_start(window_days);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.error_category, COUNT(*)
             FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE r.started_at >= ?1 AND t.error_category IS NOT NULL
             GROUP BY t.error_category
             ORDER BY COUNT(*) DESC, t.error_category ASC",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            let n: i64 = row.get(1)?;
            Ok(CategoryCount {
                category: row.get(0)?,
                count: n as u64,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn history_revision(&self, test_identity: &str) -> Result<HistoryRevision, StorageError> {
        let conn = self.lock()?;
        let (count, max_id): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(MAX(id), 0) FROM test_results WHERE test_identity = ?1",
            params![test_identity],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(HistoryRevision {
            count: count as u64,
            max_id,
        })
    }

    /// All recorded outcomes for the identity, ordered by run start.
    pub fn outcome_sequence(&self, test_identity: &str) -> Result<Vec<Outcome>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.outcome
             FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE t.test_identity = ?1
             ORDER BY r.started_at ASC, r.run_id ASC",
        )?;
        let rows = stmt.query_map(params![test_identity], |row| {
            let raw: String = row.get(0)?;
            outcome_from_sql(0, &raw)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn identities_in_window(&self, window_days: u32) -> Result<Vec<String>, StorageError> {
        let since = window_start(window_days);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT t.test_identity
             FROM test_results t
             JOIN test_runs r ON r.run_id = t.run_id
             WHERE r.started_at >= ?1
             ORDER BY t.test_identity ASC",
        )?;
        let rows = stmt.query_map(params![since], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn ratio(num: i64, denom: i64) -> Option<f64> {
    pass_rate(num.max(0) as u32, (denom - num).max(0) as u32, 0)
}
