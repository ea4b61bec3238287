//! Store error types.

use thiserror::Error;

use crate::version::MonotonicVersion;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError<T = MonotonicVersion> {
    /// Version mismatch (optimistic concurrency control). `actual` is the
    /// version currently stored for the key.
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: T, actual: T },

    /// The store has been closed.
    #[error("store closed")]
    Closed,

    /// The subscriber fell behind and its event stream was cut.
    #[error("event stream interrupted: subscriber buffer overflowed")]
    InterruptedEventStream,
}

/// Result type for store operations.
pub type Result<R, T = MonotonicVersion> = std::result::Result<R, StoreError<T>>;
