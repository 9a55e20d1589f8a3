//! Unified error types for transport operations.

use thiserror::Error;

/// Errors that can occur in transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Client construction failed.
    #[error("failed to build HTTP client: {0}")]
    Build(String),

    /// The request could not be sent or the response not read.
    #[error("request to {url} failed: {reason}")]
    Request {
        /// Target URL.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The upstream answered with a non-success status after all retries.
    #[error("upstream {url} returned status {status}")]
    Status {
        /// Target URL.
        url: String,
        /// Final HTTP status code.
        status: u16,
    },

    /// The anti-bot challenge was still unsolved after the retry budget.
    #[error("challenge at {url} not cleared after {attempts} attempts")]
    ChallengeFailed {
        /// Target URL.
        url: String,
        /// Attempts spent.
        attempts: u32,
    },

    /// A request builder with a streaming body cannot be cloned for retry.
    #[error("request is not clonable, cannot retry")]
    NotClonable,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
