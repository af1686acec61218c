pub mod broadcaster;
pub mod server;

pub use broadcaster::{Broadcaster, ClientHandle, ClientId, ClientInfo};
pub use server::RealtimeServer;

use crate::model::{Outcome, RunCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line on the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    SessionStart {
        run_id: String,
        started_at: DateTime<Utc>,
        summary: RunCounts,
    },
    TestResult {
        run_id: String,
        test_identity: String,
        outcome: Outcome,
        duration_ms: u64,
    },
    SessionFinish {
        run_id: String,
        summary: RunCounts,
    },
    /// `missed` events were dropped for this client at this point.
    Gap { missed: u64 },
}

impl LiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LiveEvent::SessionStart { .. } => "session_start",
            LiveEvent::TestResult { .. } => "test_result",
            LiveEvent::SessionFinish { .. } => "session_finish",
            LiveEvent::Gap { .. } => "gap",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let ev = LiveEvent::TestResult {
            run_id: "r".into(),
            test_identity: "t::a".into(),
            outcome: Outcome::Failed,
            duration_ms: 12,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "test_result", "run_id": "r", "test_identity": "t::a", "outcome": "failed", "duration_ms": 12})
        );
        assert_eq!(
            serde_json::to_value(LiveEvent::Gap { missed: 3 }).unwrap(),
            json!({"type": "gap", "missed": 3})
        );
    }
}
