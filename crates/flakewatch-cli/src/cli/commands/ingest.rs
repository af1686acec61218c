use super::{engine_config, exit_codes, percent, print_json};
use crate::cli::args::{IngestArgs, OutputFormat};
use anyhow::Context;
use flakewatch_core::ingest::{SessionContext, SessionReport};
use flakewatch_core::model::{Outcome, RunMetadata};
use flakewatch_core::Telemetry;
use serde::Deserialize;
use std::io::{BufRead, BufReader};

/// One line of a hook-event file.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HookEvent {
    SessionStart {
        #[serde(default)]
        metadata: RunMetadata,
    },
    TestOutcome {
        test_identity: String,
        outcome: String,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        error: Option<String>,
    },
    SessionFinish,
}

pub fn cmd_ingest(args: IngestArgs) -> anyhow::Result<i32> {
    let mut cfg = engine_config(&args.engine)?;
    cfg.realtime_enabled = args.live;
    if let Some(port) = args.port {
        cfg.realtime_port = port;
    }
    super::ensure_parent_dir(&cfg.database_path)?;

    let reader: Box<dyn BufRead> = if args.events.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(&args.events)
            .with_context(|| format!("failed to open {}", args.events.display()))?;
        Box::new(BufReader::new(file))
    };

    let telemetry = Telemetry::new(cfg)?;
    if args.live {
        match telemetry.realtime_addr() {
            Some(addr) => eprintln!("live feed on {}", addr),
            None => eprintln!("warning: live feed unavailable (see log)"),
        }
    }

    let reports = replay(&telemetry, reader)?;
    for r in &reports {
        if let Some(w) = &r.warning {
            eprintln!("warning: {}", w);
        }
    }
    match args.format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Text => reports.iter().for_each(print_report),
    }

    if args.hold && telemetry.realtime_addr().is_some() {
        eprintln!("holding live feed open; press Ctrl-C to stop");
        if let Some(Err(e)) = telemetry.block_on(tokio::signal::ctrl_c()) {
            tracing::warn!(event = "signal_wait_failed", error = %e);
        }
    }
    telemetry.shutdown();
    Ok(exit_codes::OK)
}

fn replay(telemetry: &Telemetry, reader: Box<dyn BufRead>) -> anyhow::Result<Vec<SessionReport>> {
    let pipeline = telemetry.pipeline();
    let mut current: Option<SessionContext> = None;
    let mut reports = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.with_context(|| format!("failed to read line {}", line_no))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: HookEvent = serde_json::from_str(&line)
            .with_context(|| format!("invalid event on line {}", line_no))?;

        match event {
            HookEvent::SessionStart { metadata } => {
                if let Some(open) = current.take() {
                    tracing::warn!(event = "session_not_finished", run_id = %open.run_id(), line = line_no);
                    reports.push(pipeline.on_session_finish(open));
                }
                current = Some(pipeline.on_session_start(metadata));
            }
            HookEvent::TestOutcome {
                test_identity,
                outcome,
                duration_ms,
                error,
            } => {
                let outcome = Outcome::parse(&outcome).ok_or_else(|| {
                    anyhow::anyhow!("unknown outcome '{}' on line {}", outcome, line_no)
                })?;
                let ctx = current
                    .get_or_insert_with(|| pipeline.on_session_start(RunMetadata::default()));
                pipeline.on_test_outcome(ctx, &test_identity, outcome, duration_ms, error.as_deref());
            }
            HookEvent::SessionFinish => match current.take() {
                Some(ctx) => reports.push(pipeline.on_session_finish(ctx)),
                None => tracing::warn!(event = "finish_without_start", line = line_no),
            },
        }
    }

    if let Some(open) = current.take() {
        tracing::warn!(event = "session_not_finished", run_id = %open.run_id());
        reports.push(pipeline.on_session_finish(open));
    }
    Ok(reports)
}

fn print_report(report: &SessionReport) {
    let c = &report.run.counts;
    println!(
        "run {}: {} tests, {} passed, {} failed, {} skipped, {} errors (pass rate {})",
        report.run.run_id,
        c.total,
        c.passed,
        c.failed,
        c.skipped,
        c.errors,
        percent(report.pass_rate())
    );
    if report.dropped > 0 {
        println!("  {} outcomes dropped (buffer full)", report.dropped);
    }
    for e in &report.errors {
        println!(
            "  [{} / {}] {}: {}",
            e.signature.category,
            e.signature.severity.as_str(),
            e.test_identity,
            e.signature.normalized_message
        );
        for s in &e.signature.suggested_actions {
            println!("      - {}", s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_event_shapes() {
        let e: HookEvent = serde_json::from_str(
            r#"{"event":"test_outcome","test_identity":"t::a","outcome":"failed","error":"boom"}"#,
        )
        .unwrap();
        match e {
            HookEvent::TestOutcome {
                duration_ms, error, ..
            } => {
                assert_eq!(duration_ms, 0);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let e: HookEvent =
            serde_json::from_str(r#"{"event":"session_start","metadata":{"branch":"main"}}"#).unwrap();
        assert!(matches!(e, HookEvent::SessionStart { metadata } if metadata.branch.as_deref() == Some("main")));

        assert!(serde_json::from_str::<HookEvent>(r#"{"event":"nope"}"#).is_err());
    }
}
