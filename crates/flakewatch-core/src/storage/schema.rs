pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS test_runs (
  run_id        TEXT PRIMARY KEY,
  started_at    INTEGER NOT NULL,
  finished_at   INTEGER NOT NULL,
  total         INTEGER NOT NULL,
  passed        INTEGER NOT NULL,
  failed        INTEGER NOT NULL,
  skipped       INTEGER NOT NULL,
  errors        INTEGER NOT NULL,
  metadata_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS test_results (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id         TEXT NOT NULL REFERENCES test_runs(run_id),
  test_identity  TEXT NOT NULL,
  outcome        TEXT NOT NULL,
  duration_ms    INTEGER NOT NULL,
  error_category TEXT,
  error_severity TEXT,
  error_hash     TEXT,
  error_message  TEXT,
  UNIQUE(run_id, test_identity)
);

CREATE INDEX IF NOT EXISTS idx_results_identity_run ON test_results(test_identity, run_id);
CREATE INDEX IF NOT EXISTS idx_runs_started_at ON test_runs(started_at);
CREATE INDEX IF NOT EXISTS idx_runs_finished_at ON test_runs(finished_at);
"#;
