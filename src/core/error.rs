//! Error kinds surfaced by node operations.

use thiserror::Error;

/// Errors produced by the consensus core. Each kind maps to a stable
/// numeric code at the RPC/API boundary via [`RaftError::code`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RaftError {
    /// Bad argument, wrong role, shutdown node, or malformed input.
    #[error("invalid: {0}")]
    Invalid(String),
    /// The operation requires leadership.
    #[error("not permitted: {0}")]
    NotPermitted(String),
    /// An URI or peer could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate node registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Transient condition, retry later (snapshot busy, pending conf change).
    #[error("retry: {0}")]
    Retry(String),
    /// Superseded by newer state (snapshot save lost to a newer install).
    #[error("stale: {0}")]
    Stale(String),
    /// A bounded wait expired.
    #[error("timed out: {0}")]
    TimedOut(String),
    /// Underlying storage or RPC failure, surfaced verbatim.
    #[error("io: {0}")]
    Io(String),
}

impl RaftError {
    /// Numeric code used on the wire and in status payloads.
    pub fn code(&self) -> i32 {
        match self {
            RaftError::Invalid(_) => 22,
            RaftError::NotPermitted(_) => 1,
            RaftError::NotFound(_) => 2,
            RaftError::AlreadyExists(_) => 17,
            RaftError::Retry(_) => 11,
            RaftError::Stale(_) => 116,
            RaftError::TimedOut(_) => 110,
            RaftError::Io(_) => 5,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RaftError::Invalid(msg.into())
    }
}
