use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Error => "error",
        }
    }

    /// Accepts the spellings host runners commonly report ("pass", "xfail" excluded).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passed" | "pass" | "ok" => Some(Outcome::Passed),
            "failed" | "fail" | "failure" => Some(Outcome::Failed),
            "skipped" | "skip" => Some(Outcome::Skipped),
            "error" | "errored" => Some(Outcome::Error),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

/// Branch/commit/environment context captured at session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
}

impl RunCounts {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> Self {
        let mut counts = Self::default();
        for o in outcomes {
            counts.record(*o);
        }
        counts
    }

    pub fn record(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Error => self.errors += 1,
        }
    }

    pub fn forget(&mut self, outcome: Outcome) {
        self.total = self.total.saturating_sub(1);
        let slot = match outcome {
            Outcome::Passed => &mut self.passed,
            Outcome::Failed => &mut self.failed,
            Outcome::Skipped => &mut self.skipped,
            Outcome::Error => &mut self.errors,
        };
        *slot = slot.saturating_sub(1);
    }

    /// passed / (passed + failed + errors); skipped tests never count.
    pub fn pass_rate(&self) -> Option<f64> {
        pass_rate(self.passed, self.failed, self.errors)
    }

    pub fn is_consistent(&self) -> bool {
        self.passed + self.failed + self.skipped + self.errors == self.total
    }
}

pub fn pass_rate(passed: u32, failed: u32, errors: u32) -> Option<f64> {
    let denom = passed + failed + errors;
    if denom == 0 {
        None
    } else {
        Some(passed as f64 / denom as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: RunCounts,
    #[serde(default)]
    pub metadata: RunMetadata,
}

impl TestRun {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// The persisted projection of an `ErrorSignature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: String,
    pub severity: Severity,
    pub normalized_hash: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub run_id: String,
    pub test_identity: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_parse_aliases() {
        assert_eq!(Outcome::parse("PASS"), Some(Outcome::Passed));
        assert_eq!(Outcome::parse("failed"), Some(Outcome::Failed));
        assert_eq!(Outcome::parse(" skip "), Some(Outcome::Skipped));
        assert_eq!(Outcome::parse("errored"), Some(Outcome::Error));
        assert_eq!(Outcome::parse("xpass"), None);
    }

    #[test]
    fn test_pass_rate_excludes_skipped() {
        let outcomes = [
            Outcome::Passed,
            Outcome::Passed,
            Outcome::Failed,
            Outcome::Skipped,
            Outcome::Skipped,
        ];
        let counts = RunCounts::from_outcomes(&outcomes);
        assert_eq!(counts.total, 5);
        assert!(counts.is_consistent());
        let rate = counts.pass_rate().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_pass_rate_all_skipped_is_none() {
        let counts = RunCounts::from_outcomes(&[Outcome::Skipped]);
        assert_eq!(counts.pass_rate(), None);
    }

    #[test]
    fn test_forget_reverses_record() {
        let mut counts = RunCounts::default();
        counts.record(Outcome::Error);
        counts.record(Outcome::Passed);
        counts.forget(Outcome::Error);
        assert_eq!(counts.total, 1);
        assert_eq!(counts.errors, 0);
        assert_eq!(counts.passed, 1);
    }

    #[test]
    fn test_run_serializes_flat_counts() {
        let run = TestRun {
            run_id: "r1".into(),
            started_at: DateTime::<Utc>::default(),
            finished_at: DateTime::<Utc>::default(),
            counts: RunCounts::from_outcomes(&[Outcome::Passed]),
            metadata: RunMetadata::default(),
        };
        let v = serde_json::to_value(&run).unwrap();
        assert_eq!(v["passed"], 1);
        assert_eq!(v["total"], 1);
    }
}
