use flakewatch_core::analyzer::PatternAnalyzer;
use flakewatch_core::config::EngineConfig;
use flakewatch_core::ingest::{IngestOptions, IngestPipeline, PersistStatus};
use flakewatch_core::model::{Outcome, RunMetadata};
use flakewatch_core::realtime::Broadcaster;
use flakewatch_core::storage::{Store, TrendScope};
use flakewatch_core::Telemetry;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_session_to_trend_and_classification() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("history.db")).unwrap();
    store.init_schema().unwrap();
    let pipeline = IngestPipeline::new(
        Some(store.clone()),
        Arc::new(PatternAnalyzer::new(256).unwrap()),
        Broadcaster::new(64),
        IngestOptions::default(),
    );

    let mut ctx = pipeline.on_session_start(RunMetadata {
        branch: Some("main".into()),
        commit: Some("abc123".into()),
        ..RunMetadata::default()
    });
    for i in 0..7 {
        pipeline.on_test_outcome(&mut ctx, &format!("tests/test_ok.py::test_{i}"), Outcome::Passed, 5, None);
    }
    pipeline.on_test_outcome(
        &mut ctx,
        "tests/test_math.py::test_sum",
        Outcome::Failed,
        8,
        Some("AssertionError: expected 5 got 3"),
    );
    pipeline.on_test_outcome(
        &mut ctx,
        "tests/test_api.py::test_fetch",
        Outcome::Failed,
        30,
        Some("ConnectionRefusedError: port 8080"),
    );
    pipeline.on_test_outcome(&mut ctx, "tests/test_slow.py::test_big", Outcome::Skipped, 0, None);
    let run_id = ctx.run_id().to_string();
    let report = pipeline.on_session_finish(ctx);

    assert_eq!(report.persist, PersistStatus::Persisted);
    let c = report.run.counts;
    assert_eq!((c.total, c.passed, c.failed, c.skipped, c.errors), (10, 7, 2, 1, 0));
    assert_eq!(store.fetch_results_for_run(&run_id).unwrap().len(), 10);

    let stored = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(stored.metadata.commit.as_deref(), Some("abc123"));

    let series = store.query_trend(TrendScope::Global, 1).unwrap();
    let points = series.points();
    assert_eq!(points.len(), 1);
    let rate = points[0].pass_rate.unwrap();
    assert!((rate - 7.0 / 9.0).abs() < 1e-9);

    let by_test: std::collections::HashMap<_, _> = report
        .errors
        .iter()
        .map(|e| (e.test_identity.as_str(), &e.signature))
        .collect();
    let assertion = by_test["tests/test_math.py::test_sum"];
    assert_eq!(assertion.category, "ASSERTION_FAILURE");
    assert!(!assertion.suggested_actions.is_empty());
    let conn = by_test["tests/test_api.py::test_fetch"];
    assert_eq!(conn.category, "CONNECTION_ERROR");
    assert!(!conn.suggested_actions.is_empty());

    let stored_errors: Vec<_> = store
        .fetch_results_for_run(&run_id)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.error)
        .collect();
    assert_eq!(stored_errors.len(), 2);
}

#[test]
fn test_unknown_identity_and_empty_window() {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    assert!(store.query_trend(TrendScope::Global, 30).unwrap().is_empty());
    assert!(store
        .query_trend(TrendScope::Test("nope".into()), 30)
        .unwrap()
        .is_empty());
    assert!(store.statistics(10).unwrap().most_failed.is_empty());
}

#[test]
fn test_facade_runs_without_realtime() {
    let dir = TempDir::new().unwrap();
    let cfg = EngineConfig {
        database_path: dir.path().join("history.db"),
        realtime_enabled: false,
        ..EngineConfig::default()
    };
    let telemetry = Telemetry::new(cfg).unwrap();
    assert!(telemetry.realtime_addr().is_none());

    for outcome in [Outcome::Passed, Outcome::Failed, Outcome::Passed, Outcome::Failed, Outcome::Passed] {
        let mut ctx = telemetry.pipeline().on_session_start(RunMetadata::default());
        let err = outcome.is_failure().then_some("TimeoutError: operation timed out");
        telemetry.pipeline().on_test_outcome(&mut ctx, "t::flip", outcome, 10, err);
        let report = telemetry.pipeline().on_session_finish(ctx);
        assert_eq!(report.persist, PersistStatus::Persisted);
    }

    let flaky = telemetry.flaky().unwrap().flaky_tests(1).unwrap();
    assert_eq!(flaky.len(), 1);
    assert_eq!(flaky[0].test_identity, "t::flip");
    assert!((flaky[0].instability_score - 1.0).abs() < 1e-9);
    telemetry.shutdown();
}

#[test]
fn test_unwritable_store_degrades() {
    let dir = TempDir::new().unwrap();
    // SQLite does not create missing parent directories.
    let cfg = EngineConfig {
        database_path: dir.path().join("missing").join("history.db"),
        realtime_enabled: false,
        ..EngineConfig::default()
    };
    let telemetry = Telemetry::new(cfg).unwrap();
    assert!(telemetry.store().is_none());
    assert!(telemetry.flaky().is_none());

    let mut ctx = telemetry.pipeline().on_session_start(RunMetadata::default());
    telemetry
        .pipeline()
        .on_test_outcome(&mut ctx, "a", Outcome::Error, 1, Some("ImportError: No module named 'foo'"));
    let report = telemetry.pipeline().on_session_finish(ctx);
    assert_eq!(report.persist, PersistStatus::Disabled);
    assert!(report.warning.is_some());
    assert_eq!(report.errors[0].signature.category, "IMPORT_ERROR");
}

#[test]
fn test_taken_realtime_port_degrades() {
    let dir = TempDir::new().unwrap();
    let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = squatter.local_addr().unwrap().port();
    let cfg = EngineConfig {
        database_path: dir.path().join("history.db"),
        realtime_enabled: true,
        realtime_host: "127.0.0.1".into(),
        realtime_port: port,
        ..EngineConfig::default()
    };
    let telemetry = Telemetry::new(cfg).unwrap();
    assert!(telemetry.realtime_addr().is_none());
    assert!(telemetry.store().is_some());

    for _ in 0..2 {
        let mut ctx = telemetry.pipeline().on_session_start(RunMetadata::default());
        telemetry.pipeline().on_test_outcome(&mut ctx, "t::a", Outcome::Passed, 2, None);
        let report = telemetry.pipeline().on_session_finish(ctx);
        assert_eq!(report.persist, PersistStatus::Persisted);
    }
    assert_eq!(telemetry.store().unwrap().count_runs().unwrap(), 2);
    drop(squatter);
}
