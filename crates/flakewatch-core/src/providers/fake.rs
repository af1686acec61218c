use super::{AnalysisProvider, AnalysisRequest, AnalysisResponse};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Scripted provider for tests and offline runs.
#[derive(Debug, Default)]
pub struct FakeProvider {
    pub suggestions: Vec<String>,
    pub notes: Option<String>,
    pub delay: Option<Duration>,
    pub fail: bool,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn answering(suggestions: &[&str]) -> Self {
        Self {
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisProvider for FakeProvider {
    async fn analyze(&self, _request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.fail {
            anyhow::bail!("fake provider failure");
        }
        Ok(AnalysisResponse {
            suggestions: self.suggestions.clone(),
            notes: self.notes.clone(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}
