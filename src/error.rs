/// Error taxonomy (SPEC_FULL.md §7).
///
/// Callers branch on *kind* — retry, skip, or fatal — so this is a proper enum
/// rather than a single message string (contrast `crate::error`'s ancestor, the
/// teacher's `MyError` in `types.rs`, which only needed `Display`).
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// RPC 5xx, timeout, connection reset. Retried with exponential backoff;
    /// surfaced only after the retry ladder is exhausted.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// Remote 429 / explicit rate-limit response. Uses a longer backoff ladder.
    #[error("rate limited, retry after {retry_after:?}: {source}")]
    RateLimited {
        retry_after: Duration,
        source: String,
    },

    /// The requested height is beyond the chain head. Callers treat this as a
    /// skip, never an error condition to log loudly.
    #[error("height not yet available")]
    NotYetAvailable,

    /// Reorg detected at `at`. Never retried; propagated to the Sequencer.
    #[error("reorg detected at height {at}")]
    Reorg { at: u64 },

    /// The Sequencer's buffer exceeded its hard cap; `from` is the height the
    /// expected cursor was skipped forward to.
    #[error("buffer overflow, skipped to height {from}")]
    BufferOverflow { from: u64 },

    /// A downstream channel's depth exceeded its watermark; `Schedule` fails
    /// fast rather than enqueueing into an already-saturated pipeline.
    #[error("backpressure: depth {depth} exceeds watermark over capacity {capacity}")]
    Backpressure { depth: usize, capacity: usize },

    /// Context cancellation or deadline exceeded. Terminal; never retried.
    #[error("operation cancelled")]
    Cancelled,

    /// A block failed `BlockRecord::sanity_check`.
    #[error("invalid block at height {height}: {reason}")]
    InvalidBlock { height: u64, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

impl IndexerError {
    /// Whether the Fetcher's retry ladder should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexerError::Transient(_) | IndexerError::RateLimited { .. })
    }

    /// Whether this failure should classify as rate-limited backoff (1s ladder)
    /// rather than the default transient ladder (100ms).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, IndexerError::RateLimited { .. })
    }

    /// `ReorgError` and cancellation are fatal: `ProcessBlockWithRetry` must
    /// never retry them (§4.3).
    pub fn is_fatal_for_retry(&self) -> bool {
        matches!(self, IndexerError::Reorg { .. } | IndexerError::Cancelled)
    }
}

/// Failures from the out-of-scope RPC transport boundary (§6).
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("not found: height {0}")]
    NotFound(u64),
}

/// Failures from the out-of-scope SQL store boundary (§6).
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),
    #[error("not found")]
    NotFound,
}

/// Returned by `Shutdown(timeout)` when workers fail to quiesce in time.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown deadline exceeded after {0:?}")]
    Deadline(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_and_cancelled_are_fatal_for_retry() {
        assert!(IndexerError::Reorg { at: 5 }.is_fatal_for_retry());
        assert!(IndexerError::Cancelled.is_fatal_for_retry());
        assert!(!IndexerError::NotYetAvailable.is_fatal_for_retry());
    }

    #[test]
    fn transient_and_rate_limited_are_retryable() {
        assert!(IndexerError::Transient("x".into()).is_retryable());
        assert!(IndexerError::RateLimited {
            retry_after: Duration::from_secs(1),
            source: "x".into()
        }
        .is_retryable());
        assert!(!IndexerError::NotYetAvailable.is_retryable());
        assert!(!IndexerError::BufferOverflow { from: 1 }.is_retryable());
    }
}
