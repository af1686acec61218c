pub mod analyzer;
pub mod config;
pub mod errors;
pub mod flaky;
pub mod ingest;
pub mod model;
pub mod providers;
pub mod realtime;
pub mod storage;
pub mod telemetry;

pub use telemetry::Telemetry;
