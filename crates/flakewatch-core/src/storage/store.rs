use super::{from_millis, to_millis, window_start};
use crate::errors::StorageError;
use crate::model::{ClassifiedError, Outcome, RunCounts, RunMetadata, Severity, TestResult, TestRun};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable run history. Clones share one connection; separate processes
/// opening the same file rely on SQLite locking (WAL + busy timeout).
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
    recency_window_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub cutoff: DateTime<Utc>,
    pub runs_deleted: usize,
    pub results_deleted: usize,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self::from_connection(conn))
    }

    pub fn memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            recency_window_days: 90,
        }
    }

    /// Window used by the ranking queries; normally `retention_days`.
    pub fn with_recency_window(mut self, days: u32) -> Self {
        self.recency_window_days = days;
        self
    }

    pub fn recency_window_days(&self) -> u32 {
        self.recency_window_days
    }

    pub fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute_batch(super::schema::DDL)?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Writes the finalized run and all of its results in one transaction.
    /// Nothing is committed unless the counts agree with the result rows.
    pub fn record_run(&self, run: &TestRun, results: &[TestResult]) -> Result<(), StorageError> {
        validate_run(run, results)?;
        let metadata_json = serde_json::to_string(&run.metadata)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO test_runs(run_id, started_at, finished_at, total, passed, failed, skipped, errors, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_id,
                to_millis(&run.started_at),
                to_millis(&run.finished_at),
                run.counts.total,
                run.counts.passed,
                run.counts.failed,
                run.counts.skipped,
                run.counts.errors,
                metadata_json,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO test_results(run_id, test_identity, outcome, duration_ms, error_category, error_severity, error_hash, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for r in results {
                let err = r.error.as_ref();
                stmt.execute(params![
                    r.run_id,
                    r.test_identity,
                    r.outcome.as_str(),
                    r.duration_ms as i64,
                    err.map(|e| e.category.as_str()),
                    err.map(|e| e.severity.as_str()),
                    err.map(|e| e.normalized_hash.as_str()),
                    err.map(|e| e.message.as_str()),
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            event = "run_recorded",
            run_id = %run.run_id,
            results = results.len()
        );
        Ok(())
    }

    /// Deletes runs (and their results) that finished more than `retention_days` ago.
    pub fn purge_older_than(&self, retention_days: u32) -> Result<PurgeSummary, StorageError> {
        let cutoff_ms = window_start(retention_days);
        self.purge_before(from_millis(cutoff_ms))
    }

    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeSummary, StorageError> {
        let cutoff_ms = to_millis(&cutoff);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let results_deleted = tx.execute(
            "DELETE FROM test_results WHERE run_id IN (SELECT run_id FROM test_runs WHERE finished_at < ?1)",
            params![cutoff_ms],
        )?;
        let runs_deleted = tx.execute(
            "DELETE FROM test_runs WHERE finished_at < ?1",
            params![cutoff_ms],
        )?;
        tx.commit()?;

        tracing::info!(
            event = "history_purged",
            cutoff = %cutoff.to_rfc3339(),
            runs = runs_deleted,
            results = results_deleted
        );
        Ok(PurgeSummary {
            cutoff,
            runs_deleted,
            results_deleted,
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<TestRun>, StorageError> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM test_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn fetch_results_for_run(&self, run_id: &str) -> Result<Vec<TestResult>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, test_identity, outcome, duration_ms, error_category, error_severity, error_hash, error_message
             FROM test_results WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], result_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<TestRun>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_runs ORDER BY started_at DESC, run_id DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit], run_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_runs(&self) -> Result<u64, StorageError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM test_runs", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

pub(crate) const RUN_COLUMNS: &str =
    "run_id, started_at, finished_at, total, passed, failed, skipped, errors, metadata_json";

pub(crate) fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    let metadata_json: String = row.get(8)?;
    let metadata: RunMetadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(TestRun {
        run_id: row.get(0)?,
        started_at: from_millis(row.get(1)?),
        finished_at: from_millis(row.get(2)?),
        counts: RunCounts {
            total: row.get(3)?,
            passed: row.get(4)?,
            failed: row.get(5)?,
            skipped: row.get(6)?,
            errors: row.get(7)?,
        },
        metadata,
    })
}

pub(crate) fn outcome_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Outcome> {
    Outcome::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown outcome '{}'", raw).into(),
        )
    })
}

/// Columns: run_id, test_identity, outcome, duration_ms, category, severity, hash, message.
pub(crate) fn result_from_row(row: &Row<'_>) -> rusqlite::Result<TestResult> {
    let outcome: String = row.get(2)?;
    let duration: i64 = row.get(3)?;
    Ok(TestResult {
        run_id: row.get(0)?,
        test_identity: row.get(1)?,
        outcome: outcome_from_sql(2, &outcome)?,
        duration_ms: duration.max(0) as u64,
        error: error_from_row(row, 4)?,
    })
}

pub(crate) fn error_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Option<ClassifiedError>> {
    let category: Option<String> = row.get(first)?;
    let Some(category) = category else {
        return Ok(None);
    };
    let severity: Option<String> = row.get(first + 1)?;
    Ok(Some(ClassifiedError {
        category,
        severity: Severity::parse(severity.as_deref().unwrap_or("medium")),
        normalized_hash: row.get::<_, Option<String>>(first + 2)?.unwrap_or_default(),
        message: row.get::<_, Option<String>>(first + 3)?.unwrap_or_default(),
    }))
}

fn validate_run(run: &TestRun, results: &[TestResult]) -> Result<(), StorageError> {
    if run.finished_at < run.started_at {
        return Err(StorageError::Constraint(format!(
            "run {} finishes before it starts",
            run.run_id
        )));
    }
    if let Some(stray) = results.iter().find(|r| r.run_id != run.run_id) {
        return Err(StorageError::Constraint(format!(
            "result '{}' belongs to run {}, not {}",
            stray.test_identity, stray.run_id, run.run_id
        )));
    }
    let actual = RunCounts::from_outcomes(results.iter().map(|r| &r.outcome));
    if actual != run.counts {
        return Err(StorageError::Constraint(format!(
            "run {} counts {:?} disagree with {} result rows {:?}",
            run.run_id,
            run.counts,
            results.len(),
            actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn run_with(run_id: &str, outcomes: &[Outcome]) -> (TestRun, Vec<TestResult>) {
        let now = Utc::now();
        let results: Vec<TestResult> = outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| TestResult {
                run_id: run_id.to_string(),
                test_identity: format!("tests/test_mod.py::test_{}", i),
                outcome: *o,
                duration_ms: 10 * (i as u64 + 1),
                error: None,
            })
            .collect();
        let run = TestRun {
            run_id: run_id.to_string(),
            started_at: now - ChronoDuration::seconds(5),
            finished_at: now,
            counts: RunCounts::from_outcomes(outcomes),
            metadata: RunMetadata {
                branch: Some("main".into()),
                ..Default::default()
            },
        };
        (run, results)
    }

    fn store() -> Store {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s
    }

    #[test]
    fn test_record_and_read_back() {
        let s = store();
        let (run, results) = run_with("r1", &[Outcome::Passed, Outcome::Failed, Outcome::Skipped]);
        s.record_run(&run, &results).unwrap();

        let back = s.get_run("r1").unwrap().unwrap();
        assert_eq!(back.counts, run.counts);
        assert_eq!(back.metadata.branch.as_deref(), Some("main"));
        assert_eq!(back.started_at.timestamp_millis(), run.started_at.timestamp_millis());
        assert_eq!(s.fetch_results_for_run("r1").unwrap(), results);
    }

    #[test]
    fn test_count_mismatch_commits_nothing() {
        let s = store();
        let (mut run, results) = run_with("r1", &[Outcome::Passed, Outcome::Passed]);
        run.counts.passed = 1;
        let err = s.record_run(&run, &results).unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
        assert!(s.get_run("r1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_identity_rolls_back() {
        let s = store();
        let (run, mut results) = run_with("r1", &[Outcome::Passed, Outcome::Failed]);
        results[1].test_identity = results[0].test_identity.clone();
        assert!(s.record_run(&run, &results).is_err());
        assert!(s.get_run("r1").unwrap().is_none());
        assert!(s.fetch_results_for_run("r1").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_run_id_rejected() {
        let s = store();
        let (run, results) = run_with("r1", &[Outcome::Passed]);
        s.record_run(&run, &results).unwrap();
        assert!(s.record_run(&run, &results).is_err());
        assert_eq!(s.fetch_results_for_run("r1").unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_run_id_rejected() {
        let s = store();
        let (run, mut results) = run_with("r1", &[Outcome::Passed]);
        results[0].run_id = "other".into();
        assert!(matches!(
            s.record_run(&run, &results),
            Err(StorageError::Constraint(_))
        ));
    }

    #[test]
    fn test_purge_removes_old_runs_only() {
        let s = store();
        let (mut old, old_results) = run_with("old", &[Outcome::Passed]);
        old.started_at = Utc::now() - ChronoDuration::days(120);
        old.finished_at = old.started_at + ChronoDuration::seconds(3);
        s.record_run(&old, &old_results).unwrap();
        let (fresh, fresh_results) = run_with("fresh", &[Outcome::Failed, Outcome::Passed]);
        s.record_run(&fresh, &fresh_results).unwrap();

        let summary = s.purge_older_than(90).unwrap();
        assert_eq!(summary.runs_deleted, 1);
        assert_eq!(summary.results_deleted, 1);
        assert!(s.get_run("old").unwrap().is_none());
        assert!(s.get_run("fresh").unwrap().is_some());
        assert_eq!(s.count_runs().unwrap(), 1);
    }

    #[test]
    fn test_recent_runs_newest_first() {
        let s = store();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let (mut run, results) = run_with(id, &[Outcome::Passed]);
            run.started_at = Utc::now() - ChronoDuration::minutes(10 - i as i64);
            s.record_run(&run, &results).unwrap();
        }
        let ids: Vec<_> = s
            .recent_runs(2)
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }
}
