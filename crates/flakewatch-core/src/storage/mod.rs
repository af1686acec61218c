pub mod queries;
pub mod schema;
pub mod store;
pub mod trend;

pub use queries::{
    CategoryCount, FailureRank, HistoryEntry, HistoryRevision, HistoryStats, SlowRank,
    TrendSummary,
};
pub use store::{PurgeSummary, Store};
pub use trend::{TrendPoint, TrendScope, TrendSeries};

use chrono::{DateTime, Utc};

const DAY_MS: i64 = 86_400_000;

pub(crate) fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Unix-ms lower bound of a window of `days` ending now.
pub(crate) fn window_start(days: u32) -> i64 {
    Utc::now().timestamp_millis() - i64::from(days) * DAY_MS
}
