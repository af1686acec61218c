use flakewatch_core::analyzer::PatternAnalyzer;
use flakewatch_core::ingest::{IngestOptions, IngestPipeline};
use flakewatch_core::model::{Outcome, RunMetadata};
use flakewatch_core::realtime::Broadcaster;
use std::sync::{Arc, Mutex};

struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture<F: FnOnce()>(f: F) -> String {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || MockWriter(sink.clone()))
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn test_session_without_history_logs_degraded() {
    let pipeline = IngestPipeline::new(
        None,
        Arc::new(PatternAnalyzer::new(8).unwrap()),
        Broadcaster::new(4),
        IngestOptions::default(),
    );

    let output = capture(|| {
        let mut ctx = pipeline.on_session_start(RunMetadata::default());
        pipeline.on_test_outcome(&mut ctx, "a", Outcome::Passed, 1, None);
        pipeline.on_session_finish(ctx);
    });

    assert!(output.contains("\"event\":\"session_start\""));
    assert!(output.contains("\"event\":\"persist_degraded\""));
    assert!(output.contains("\"event\":\"session_finish\""));
    assert!(output.contains("\"total\":1"));
}

#[test]
fn test_buffer_overflow_warns_once() {
    let pipeline = IngestPipeline::new(
        None,
        Arc::new(PatternAnalyzer::new(8).unwrap()),
        Broadcaster::new(4),
        IngestOptions {
            max_buffered_results: 1,
            ..IngestOptions::default()
        },
    );

    let output = capture(|| {
        let mut ctx = pipeline.on_session_start(RunMetadata::default());
        for id in ["a", "b", "c", "d"] {
            pipeline.on_test_outcome(&mut ctx, id, Outcome::Passed, 1, None);
        }
        assert_eq!(ctx.dropped(), 3);
    });

    assert_eq!(output.matches("\"event\":\"session_buffer_full\"").count(), 1);
}
