use chrono::{DateTime, Duration, Utc};
use flakewatch_core::model::{Outcome, RunCounts, RunMetadata, TestResult, TestRun};
use flakewatch_core::storage::Store;
use std::path::Path;
use std::sync::{Arc, Barrier};
use tempfile::TempDir;

const WRITERS: usize = 4;
const RUNS_PER_WRITER: usize = 50;

fn sample_run(run_id: String, finished_at: DateTime<Utc>) -> (TestRun, Vec<TestResult>) {
    let results: Vec<TestResult> = [("t::a", Outcome::Passed), ("t::b", Outcome::Failed)]
        .iter()
        .map(|(id, o)| TestResult {
            run_id: run_id.clone(),
            test_identity: id.to_string(),
            outcome: *o,
            duration_ms: 7,
            error: None,
        })
        .collect();
    let run = TestRun {
        run_id,
        started_at: finished_at - Duration::seconds(3),
        finished_at,
        counts: RunCounts::from_outcomes(results.iter().map(|r| &r.outcome)),
        metadata: RunMetadata::default(),
    };
    (run, results)
}

fn writer(path: &Path, id: usize, barrier: &Barrier) -> Result<(), String> {
    let store = Store::open(path).map_err(|e| e.to_string())?;
    barrier.wait();
    for n in 0..RUNS_PER_WRITER {
        let (run, results) = sample_run(format!("w{}-{:03}", id, n), Utc::now());
        store.record_run(&run, &results).map_err(|e| e.to_string())?;
        if n % 10 == id % 10 {
            store.purge_older_than(30).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

#[test]
fn test_independent_handles_write_and_purge() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");

    let seed = Store::open(&path).unwrap();
    seed.init_schema().unwrap();
    for n in 0..20 {
        let (run, results) = sample_run(format!("old-{:02}", n), Utc::now() - Duration::days(200));
        seed.record_run(&run, &results).unwrap();
    }

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|id| {
            let path = path.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || writer(&path, id, &barrier))
        })
        .collect();
    let errors: Vec<String> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap().err())
        .collect();
    assert!(errors.is_empty(), "{:?}", errors);

    let reader = Store::open(&path).unwrap();
    assert_eq!(reader.count_runs().unwrap(), (WRITERS * RUNS_PER_WRITER) as u64);
    assert!(reader.get_run("old-00").unwrap().is_none());
    assert_eq!(reader.fetch_results_for_run("w3-049").unwrap().len(), 2);
}
