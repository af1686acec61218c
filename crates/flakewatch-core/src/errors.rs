//! Failure taxonomy. None of these abort the host test session; each has a
//! degrade path at the call site that produces it.

use thiserror::Error;

/// Durable read/write failure in the history store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("storage connection lock poisoned")]
    Poisoned,
}

/// The realtime listener could not bind or accept.
#[derive(Debug, Error)]
#[error("realtime transport error on {addr}: {source}")]
pub struct ConnectionError {
    pub addr: String,
    #[source]
    pub source: std::io::Error,
}

/// Sending to one observer failed. Only that observer is dropped.
#[derive(Debug, Error)]
pub enum ClientDeliveryError {
    #[error("client {client_id}: write failed: {source}")]
    Io {
        client_id: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("client {client_id}: write timed out after {after_ms}ms")]
    Timeout { client_id: u64, after_ms: u64 },
    #[error("client {client_id}: encode failed: {source}")]
    Encode {
        client_id: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// The external analysis provider did not answer in time.
#[derive(Debug, Error)]
#[error("analysis provider '{provider}' did not answer within {after_ms}ms")]
pub struct ClassificationTimeout {
    pub provider: String,
    pub after_ms: u64,
}

/// Fewer observations than the flaky detector needs. An expected outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient data: {observed} observations, {required} required")]
pub struct InsufficientData {
    pub observed: usize,
    pub required: usize,
}

#[derive(Debug, Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);
