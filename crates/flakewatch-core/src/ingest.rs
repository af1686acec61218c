//! Session lifecycle: start, per-test outcomes, finish.
//!
//! The per-test path only touches memory (the session buffer and the
//! broadcaster). Classification happens once, at finish. The durable write
//! runs on a worker thread bounded by `persist_timeout`; provider enrichment
//! runs alongside it on the runtime and only affects the returned report.

use crate::analyzer::{ErrorSignature, PatternAnalyzer};
use crate::model::{ClassifiedError, Outcome, RunCounts, RunMetadata, TestResult, TestRun};
use crate::realtime::{Broadcaster, LiveEvent};
use crate::storage::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
struct BufferedOutcome {
    test_identity: String,
    outcome: Outcome,
    duration_ms: u64,
    raw_error: Option<String>,
}

/// Per-session state owned by the host. Not shared between sessions.
#[derive(Debug)]
pub struct SessionContext {
    run_id: String,
    started_at: DateTime<Utc>,
    metadata: RunMetadata,
    buffer: Vec<BufferedOutcome>,
    index: HashMap<String, usize>,
    capacity: usize,
    counts: RunCounts,
    dropped: u64,
}

impl SessionContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn counts(&self) -> RunCounts {
        self.counts
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistStatus {
    Persisted,
    Failed { reason: String },
    TimedOut { after_ms: u64 },
    /// No history store is configured or it could not be opened.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub test_identity: String,
    pub signature: ErrorSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub run: TestRun,
    pub results: Vec<TestResult>,
    pub errors: Vec<ErrorRecord>,
    pub category_breakdown: BTreeMap<String, u32>,
    pub dropped: u64,
    pub persist: PersistStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl SessionReport {
    pub fn pass_rate(&self) -> Option<f64> {
        self.run.counts.pass_rate()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub max_buffered_results: usize,
    pub persist_timeout: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_buffered_results: 100_000,
            persist_timeout: Duration::from_millis(10_000),
        }
    }
}

pub struct IngestPipeline {
    store: Option<Store>,
    analyzer: Arc<PatternAnalyzer>,
    broadcaster: Broadcaster,
    runtime: Option<Handle>,
    options: IngestOptions,
}

impl IngestPipeline {
    pub fn new(
        store: Option<Store>,
        analyzer: Arc<PatternAnalyzer>,
        broadcaster: Broadcaster,
        options: IngestOptions,
    ) -> Self {
        Self {
            store,
            analyzer,
            broadcaster,
            runtime: None,
            options,
        }
    }

    /// Runtime used for provider enrichment at finish. Without one, failures
    /// are classified locally only.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn on_session_start(&self, metadata: RunMetadata) -> SessionContext {
        let ctx = SessionContext {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            metadata,
            buffer: Vec::new(),
            index: HashMap::new(),
            capacity: self.options.max_buffered_results,
            counts: RunCounts::default(),
            dropped: 0,
        };
        tracing::info!(
            event = "session_start",
            run_id = %ctx.run_id,
            branch = ctx.metadata.branch.as_deref().unwrap_or(""),
            commit = ctx.metadata.commit.as_deref().unwrap_or("")
        );
        self.broadcaster.publish(LiveEvent::SessionStart {
            run_id: ctx.run_id.clone(),
            started_at: ctx.started_at,
            summary: RunCounts::default(),
        });
        ctx
    }

    /// Appends to the session buffer and forwards a live event. A repeated
    /// identity replaces its earlier outcome (reruns); past capacity the
    /// outcome is dropped and counted.
    pub fn on_test_outcome(
        &self,
        ctx: &mut SessionContext,
        test_identity: &str,
        outcome: Outcome,
        duration_ms: u64,
        raw_error: Option<&str>,
    ) {
        let entry = BufferedOutcome {
            test_identity: test_identity.to_string(),
            outcome,
            duration_ms,
            raw_error: raw_error.filter(|e| !e.trim().is_empty()).map(str::to_string),
        };

        if let Some(&slot) = ctx.index.get(test_identity) {
            let previous = std::mem::replace(&mut ctx.buffer[slot], entry);
            ctx.counts.forget(previous.outcome);
            tracing::debug!(event = "outcome_replaced", run_id = %ctx.run_id, test = %test_identity);
        } else if ctx.buffer.len() >= ctx.capacity {
            ctx.dropped += 1;
            if ctx.dropped == 1 {
                tracing::warn!(
                    event = "session_buffer_full",
                    run_id = %ctx.run_id,
                    capacity = ctx.capacity
                );
            }
            return;
        } else {
            ctx.index.insert(test_identity.to_string(), ctx.buffer.len());
            ctx.buffer.push(entry);
        }
        ctx.counts.record(outcome);

        self.broadcaster.publish(LiveEvent::TestResult {
            run_id: ctx.run_id.clone(),
            test_identity: test_identity.to_string(),
            outcome,
            duration_ms,
        });
    }

    pub fn on_session_finish(&self, ctx: SessionContext) -> SessionReport {
        let SessionContext {
            run_id,
            started_at,
            metadata,
            buffer,
            counts,
            dropped,
            ..
        } = ctx;

        let run = TestRun {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now().max(started_at),
            counts,
            metadata,
        };

        let (results, errors, raw_errors) = self.classify_locally(&run_id, buffer);
        let enrichment = self.start_enrichment(raw_errors);
        let persist = self.persist(&run, &results);
        let errors = self.finish_enrichment(&run_id, errors, enrichment);

        let warning = match &persist {
            PersistStatus::Persisted => None,
            PersistStatus::Failed { reason } => Some(format!(
                "test history not saved for run {}: {}",
                run_id, reason
            )),
            PersistStatus::TimedOut { after_ms } => Some(format!(
                "test history write for run {} did not finish within {}ms",
                run_id, after_ms
            )),
            PersistStatus::Disabled => Some("test history is disabled for this session".to_string()),
        };
        if let Some(w) = &warning {
            tracing::warn!(event = "persist_degraded", run_id = %run_id, warning = %w);
        }

        let mut category_breakdown = BTreeMap::new();
        for e in &errors {
            *category_breakdown.entry(e.signature.category.clone()).or_insert(0) += 1;
        }

        self.broadcaster.publish(LiveEvent::SessionFinish {
            run_id: run_id.clone(),
            summary: counts,
        });
        tracing::info!(
            event = "session_finish",
            run_id = %run_id,
            total = counts.total,
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            errors = counts.errors,
            dropped
        );

        SessionReport {
            run,
            results,
            errors,
            category_breakdown,
            dropped,
            persist,
            warning,
        }
    }

    fn classify_locally(
        &self,
        run_id: &str,
        buffer: Vec<BufferedOutcome>,
    ) -> (Vec<TestResult>, Vec<ErrorRecord>, Vec<String>) {
        let mut results = Vec::with_capacity(buffer.len());
        let mut errors = Vec::new();
        let mut raw_errors = Vec::new();
        for b in buffer {
            let failed = b.outcome.is_failure();
            let raw = b.raw_error.filter(|_| failed);
            let signature = raw.as_deref().map(|text| self.analyzer.classify(text));
            results.push(TestResult {
                run_id: run_id.to_string(),
                test_identity: b.test_identity.clone(),
                outcome: b.outcome,
                duration_ms: b.duration_ms,
                error: signature.as_ref().map(ClassifiedError::from),
            });
            if let (Some(signature), Some(raw)) = (signature, raw) {
                errors.push(ErrorRecord {
                    test_identity: b.test_identity,
                    signature,
                });
                raw_errors.push(raw);
            }
        }
        (results, errors, raw_errors)
    }

    /// Spawns one provider call per failure on the runtime. Nothing here
    /// blocks; a runtime that is already shut down cancels the task, which
    /// closes the channel.
    fn start_enrichment(&self, raw_errors: Vec<String>) -> Option<Enrichment> {
        let handle = self.runtime.as_ref()?;
        if raw_errors.is_empty() || !self.analyzer.has_provider() {
            return None;
        }
        let deadline = Instant::now() + self.analyzer.provider_timeout() + ENRICH_GRACE;
        let analyzer = self.analyzer.clone();
        let (tx, rx) = mpsc::channel();
        handle.spawn(async move {
            let mut out: Vec<Option<ErrorSignature>> = vec![None; raw_errors.len()];
            let mut set = JoinSet::new();
            for (slot, text) in raw_errors.into_iter().enumerate() {
                let analyzer = analyzer.clone();
                set.spawn(async move { (slot, analyzer.classify_enriched(&text).await) });
            }
            while let Some(joined) = set.join_next().await {
                if let Ok((slot, signature)) = joined {
                    out[slot] = Some(signature);
                }
            }
            let _ = tx.send(out);
        });
        Some(Enrichment { rx, deadline })
    }

    /// Waits out the rest of the enrichment deadline. Whatever did not arrive
    /// keeps its local signature.
    fn finish_enrichment(
        &self,
        run_id: &str,
        mut errors: Vec<ErrorRecord>,
        enrichment: Option<Enrichment>,
    ) -> Vec<ErrorRecord> {
        let Some(Enrichment { rx, deadline }) = enrichment else {
            return errors;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(enriched) => {
                for (record, signature) in errors.iter_mut().zip(enriched) {
                    if let Some(signature) = signature {
                        record.signature = signature;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(event = "enrichment_skipped", run_id = %run_id, reason = %e);
            }
        }
        errors
    }

    /// The store write runs on a worker thread. On timeout the worker is
    /// abandoned; it still completes the write if the store comes back.
    fn persist(&self, run: &TestRun, results: &[TestResult]) -> PersistStatus {
        let Some(store) = self.store.clone() else {
            return PersistStatus::Disabled;
        };

        let job = PersistJob {
            store,
            run: run.clone(),
            results: results.to_vec(),
        };
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("flakewatch-persist".into())
            .spawn(move || {
                let _ = tx.send(job.run());
            });
        if let Err(e) = spawned {
            return PersistStatus::Failed {
                reason: format!("could not start persist worker: {}", e),
            };
        }

        let timeout = self.options.persist_timeout;
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => PersistStatus::Persisted,
            Ok(Err(e)) => PersistStatus::Failed {
                reason: e.to_string(),
            },
            Err(RecvTimeoutError::Timeout) => PersistStatus::TimedOut {
                after_ms: timeout.as_millis() as u64,
            },
            Err(RecvTimeoutError::Disconnected) => PersistStatus::Failed {
                reason: "persist worker exited without reporting".into(),
            },
        }
    }
}

/// Slack on top of the provider timeout for task scheduling.
const ENRICH_GRACE: Duration = Duration::from_millis(250);

struct Enrichment {
    rx: mpsc::Receiver<Vec<Option<ErrorSignature>>>,
    deadline: Instant,
}

struct PersistJob {
    store: Store,
    run: TestRun,
    results: Vec<TestResult>,
}

impl PersistJob {
    fn run(self) -> Result<(), crate::errors::StorageError> {
        let written = self.store.record_run(&self.run, &self.results);
        if let Err(e) = &written {
            tracing::error!(event = "persist_failed", run_id = %self.run.run_id, error = %e);
        }
        written
    }
}
