//! Error types for the Lode coin store.
use thiserror::Error;

/// Failures surfaced by a backing coin store.
///
/// Reads from a persistent view can fail transiently (I/O pressure, torn
/// connections). Callers that treat the store as a best-effort source may
/// swallow these; validation treats them as "retry or reject later".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("read failed: {0}")] ReadFailed(String),
    #[error("backend: {0}")] Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
}
