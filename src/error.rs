//! Classified sync errors
//!
//! Everything outside the request executor works with `anyhow::Error`; the
//! executor attaches one of these variants so callers can tell a deleted
//! parent (not found) from a fatal configuration problem by downcasting.

use thiserror::Error;

/// Errors raised by the mirroring engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network failure or 5xx-class response; retried with backoff.
    #[error("transient upstream failure: {message}")]
    Transient { message: String },

    /// Rate limit still in effect after the retry budget was spent.
    #[error("rate limit exceeded: {message}")]
    RateLimited { message: String },

    /// The requested node no longer exists upstream.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Missing or invalid configuration (including rejected credentials).
    #[error("invalid configuration: {message}")]
    Validation { message: String },

    /// Any other failure, fatal once local retries are exhausted.
    #[error("upstream request failed: {message}")]
    Unclassified { message: String },
}

impl SyncError {
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[inline]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    #[inline]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    #[inline]
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::Unclassified {
            message: message.into(),
        }
    }
}

/// True when `err` (or anything in its context chain) is a not-found error.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<SyncError>(),
            Some(SyncError::NotFound { .. })
        )
    })
}
