use super::{engine_config, exit_codes, open_store, percent, print_json};
use crate::cli::args::{FlakyArgs, OutputFormat, StatsArgs, TrendArgs};
use flakewatch_core::flaky::{FlakyDetector, FlakyVerdict};
use flakewatch_core::storage::TrendScope;
use serde::Serialize;

pub fn cmd_trend(args: TrendArgs) -> anyhow::Result<i32> {
    let cfg = engine_config(&args.engine)?;
    let store = open_store(&cfg)?;
    let scope = match &args.test {
        Some(id) => TrendScope::Test(id.clone()),
        None => TrendScope::Global,
    };
    let series = store.query_trend(scope, args.days)?;

    match args.format {
        OutputFormat::Json => print_json(&series.points())?,
        OutputFormat::Text => {
            if series.is_empty() {
                println!("no runs in the last {} days", args.days);
            }
            for p in series.iter() {
                println!(
                    "{}  {}  pass {:>7}  passed={} failed={} skipped={} errors={}  {}ms",
                    p.started_at.format("%Y-%m-%d %H:%M:%S"),
                    p.run_id,
                    percent(p.pass_rate),
                    p.passed,
                    p.failed,
                    p.skipped,
                    p.errors,
                    p.duration_ms
                );
            }
        }
    }
    Ok(exit_codes::OK)
}

pub fn cmd_flaky(args: FlakyArgs) -> anyhow::Result<i32> {
    let cfg = engine_config(&args.engine)?;
    let store = open_store(&cfg)?;
    let min = args.min_observations.unwrap_or(cfg.flaky_min_observations);
    let threshold = args.threshold.unwrap_or(cfg.flaky_threshold);
    let detector = FlakyDetector::new(store, min, threshold);

    let found = if let Some(id) = &args.test {
        let verdict = detector.detect_flaky(id, min)?;
        match args.format {
            OutputFormat::Json => print_json(&verdict)?,
            OutputFormat::Text => match &verdict {
                FlakyVerdict::Record(r) => println!(
                    "{}: score {:.2}, {} flips over {} runs{}",
                    r.test_identity,
                    r.instability_score,
                    r.flip_count,
                    r.total_observations,
                    if r.is_flaky { " (flaky)" } else { "" }
                ),
                FlakyVerdict::InsufficientData { observed, required } => println!(
                    "{}: not enough history ({} of {} runs)",
                    id, observed, required
                ),
            },
        }
        verdict.is_flaky()
    } else {
        let window = args.days.unwrap_or(cfg.retention_days);
        let records = detector.flaky_tests(window)?;
        match args.format {
            OutputFormat::Json => print_json(&records)?,
            OutputFormat::Text => {
                if records.is_empty() {
                    println!("no flaky tests in the last {} days", window);
                }
                for r in &records {
                    println!(
                        "{:.2}  {}  ({} flips, {} passed, {} failed, {} runs)",
                        r.instability_score,
                        r.test_identity,
                        r.flip_count,
                        r.pass_count,
                        r.fail_count,
                        r.total_observations
                    );
                }
            }
        }
        !records.is_empty()
    };

    if found && args.fail_on_flaky {
        return Ok(exit_codes::FLAKY_FOUND);
    }
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct StatsView {
    statistics: flakewatch_core::storage::HistoryStats,
    trend: flakewatch_core::storage::TrendSummary,
    error_breakdown: Vec<flakewatch_core::storage::CategoryCount>,
}

pub fn cmd_stats(args: StatsArgs) -> anyhow::Result<i32> {
    let cfg = engine_config(&args.engine)?;
    let store = open_store(&cfg)?;
    let statistics = store.statistics(args.limit)?;
    let error_breakdown = store.error_breakdown(args.days)?;
    let detector = FlakyDetector::new(store, cfg.flaky_min_observations, cfg.flaky_threshold);
    let trend = detector.trend_summary(args.days)?;

    let view = StatsView {
        statistics,
        trend,
        error_breakdown,
    };
    match args.format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Text => print_stats(&view, args.days),
    }
    Ok(exit_codes::OK)
}

fn print_stats(view: &StatsView, days: u32) {
    let s = &view.statistics;
    println!("runs: {}  results: {}", s.total_runs, s.total_results);
    println!("average pass rate: {}", percent(s.average_pass_rate));

    let t = &view.trend;
    println!(
        "last {} days: {} runs, pass rate {}, change {}, flaky tests {}",
        days,
        t.runs_in_window,
        percent(t.pass_rate),
        match t.pass_rate_change {
            Some(d) => format!("{:+.1} pts", d * 100.0),
            None => "n/a".to_string(),
        },
        t.flaky_tests.map(|n| n.to_string()).unwrap_or_else(|| "n/a".into())
    );

    if !s.most_failed.is_empty() {
        println!("\nmost failed:");
        for f in &s.most_failed {
            println!(
                "  {:>4}/{:<4} {:>6}  {}",
                f.failures,
                f.observations,
                percent(Some(f.failure_rate)),
                f.test_identity
            );
        }
    }
    if !s.slowest.is_empty() {
        println!("\nslowest:");
        for r in &s.slowest {
            println!(
                "  avg {:>8.1}ms  max {:>6}ms  {}",
                r.avg_duration_ms, r.max_duration_ms, r.test_identity
            );
        }
    }
    if !view.error_breakdown.is_empty() {
        println!("\nerror categories:");
        for c in &view.error_breakdown {
            println!("  {:>4}  {}", c.count, c.category);
        }
    }
}
