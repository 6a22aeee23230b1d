//! Error types for admission and batching

use std::sync::Arc;
use std::time::Duration;

/// Errors from rate limiter and state store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("admission denied, retry after {retry_after:?}")]
    AdmissionDenied { retry_after: Duration },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("state store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for throttle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome error for a single item submitted to a `BatchCoordinator`.
///
/// `ItemFailed` carries the processing function's error unchanged. Every item
/// of the batch that had not yet been resolved when the error surfaced
/// receives the same `Arc`.
#[derive(Debug, thiserror::Error)]
pub enum BatchError<E> {
    #[error("batch item failed: {0}")]
    ItemFailed(Arc<E>),

    #[error("batch coordinator is closed")]
    Closed,

    #[error("processing produced fewer outcomes than items")]
    MissingOutcome,

    #[error("batch admission failed: {0}")]
    Admission(String),
}

impl<E> Clone for BatchError<E> {
    fn clone(&self) -> Self {
        match self {
            BatchError::ItemFailed(e) => BatchError::ItemFailed(Arc::clone(e)),
            BatchError::Closed => BatchError::Closed,
            BatchError::MissingOutcome => BatchError::MissingOutcome,
            BatchError::Admission(msg) => BatchError::Admission(msg.clone()),
        }
    }
}
