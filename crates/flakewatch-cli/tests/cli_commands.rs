use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn flakewatch(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("flakewatch").unwrap();
    cmd.current_dir(dir).env_remove("FLAKEWATCH_LOG").env_remove("FLAKEWATCH_DB");
    cmd
}

fn session_lines(outcomes: &[(&str, &str, Option<&str>)]) -> String {
    let mut s = String::from("{\"event\":\"session_start\",\"metadata\":{\"branch\":\"main\"}}\n");
    for (id, outcome, err) in outcomes {
        let mut line = serde_json::json!({
            "event": "test_outcome",
            "test_identity": id,
            "outcome": outcome,
            "duration_ms": 12,
        });
        if let Some(e) = err {
            line["error"] = serde_json::Value::String(e.to_string());
        }
        s.push_str(&line.to_string());
        s.push('\n');
    }
    s.push_str("{\"event\":\"session_finish\"}\n");
    s
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    flakewatch(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_init_writes_sample_once() {
    let dir = TempDir::new().unwrap();
    flakewatch(dir.path())
        .arg("init")
        .assert()
        .success()
        .stderr(contains("created flakewatch.yaml"));
    let written = fs::read_to_string(dir.path().join("flakewatch.yaml")).unwrap();
    assert!(written.contains("retention_days: 90"));

    flakewatch(dir.path())
        .arg("init")
        .assert()
        .success()
        .stderr(contains("already exists"));
}

#[test]
fn test_ingest_then_trend_and_stats() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("history.db");
    let events = dir.path().join("events.jsonl");

    let mut outcomes: Vec<(&str, &str, Option<&str>)> = vec![
        ("t::p1", "passed", None),
        ("t::p2", "passed", None),
        ("t::p3", "passed", None),
        ("t::p4", "passed", None),
        ("t::p5", "passed", None),
        ("t::p6", "passed", None),
        ("t::p7", "passed", None),
        ("t::skip", "skipped", None),
    ];
    outcomes.push(("t::assert", "failed", Some("AssertionError: expected 5 got 3")));
    outcomes.push(("t::conn", "failed", Some("ConnectionRefusedError: port 8080")));
    fs::write(&events, session_lines(&outcomes)).unwrap();

    let out = flakewatch(dir.path())
        .args(["ingest", "--format", "json", "--events"])
        .arg(&events)
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let reports: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let run = &reports[0]["run"];
    assert_eq!(run["total"], 10);
    assert_eq!(run["passed"], 7);
    assert_eq!(run["failed"], 2);
    assert_eq!(run["skipped"], 1);
    assert_eq!(reports[0]["persist"]["status"], "persisted");
    assert_eq!(reports[0]["category_breakdown"]["ASSERTION_FAILURE"], 1);
    assert_eq!(reports[0]["category_breakdown"]["CONNECTION_ERROR"], 1);

    let out = flakewatch(dir.path())
        .args(["trend", "--days", "1", "--format", "json", "--db"])
        .arg(&db)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let points: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let points = points.as_array().unwrap();
    assert_eq!(points.len(), 1);
    let rate = points[0]["pass_rate"].as_f64().unwrap();
    assert!((rate - 7.0 / 9.0).abs() < 1e-9);

    flakewatch(dir.path())
        .args(["stats", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(contains("runs: 1"))
        .stdout(contains("ASSERTION_FAILURE"));
}

#[test]
fn test_flaky_exit_code() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("history.db");
    let events = dir.path().join("events.jsonl");

    let mut body = String::new();
    for outcome in ["passed", "failed", "passed", "failed", "passed"] {
        body.push_str(&session_lines(&[
            ("t::flip", outcome, Some("TimeoutError: timed out after 30s")),
            ("t::steady", "passed", None),
        ]));
    }
    fs::write(&events, body).unwrap();

    flakewatch(dir.path())
        .args(["ingest", "--events"])
        .arg(&events)
        .arg("--db")
        .arg(&db)
        .assert()
        .success();

    flakewatch(dir.path())
        .args(["flaky", "--fail-on-flaky", "--db"])
        .arg(&db)
        .assert()
        .code(1)
        .stdout(contains("t::flip"))
        .stdout(contains("t::steady").not());

    flakewatch(dir.path())
        .args(["flaky", "--test", "t::steady", "--format", "json", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(contains("\"is_flaky\": false"));
}

#[test]
fn test_classify_text() {
    let dir = TempDir::new().unwrap();
    flakewatch(dir.path())
        .args(["classify", "ConnectionRefusedError: port 8080"])
        .assert()
        .success()
        .stdout(contains("CONNECTION_ERROR"));

    flakewatch(dir.path())
        .args(["classify", "--format", "text"])
        .write_stdin("AssertionError: expected 5 got 3\n")
        .assert()
        .success()
        .stdout(contains("category: ASSERTION_FAILURE"));
}

#[test]
fn test_bad_input_is_config_error() {
    let dir = TempDir::new().unwrap();
    let events = dir.path().join("events.jsonl");
    fs::write(
        &events,
        "{\"event\":\"session_start\"}\n{\"event\":\"test_outcome\",\"test_identity\":\"a\",\"outcome\":\"maybe\"}\n",
    )
    .unwrap();
    flakewatch(dir.path())
        .args(["ingest", "--db", "h.db", "--events"])
        .arg(&events)
        .assert()
        .code(2)
        .stderr(contains("unknown outcome 'maybe'"));

    fs::write(dir.path().join("flakewatch.yaml"), "retention_dayz: 3\n").unwrap();
    flakewatch(dir.path())
        .args(["stats", "--strict-config"])
        .assert()
        .code(2)
        .stderr(contains("unknown config fields"));
}
