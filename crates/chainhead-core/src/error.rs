//! Error types for the head tracking pipeline.

use thiserror::Error;

/// Errors that can occur while tracking and broadcasting heads.
///
/// Variants carry owned strings so the error can be cloned into health
/// reports and the bounded service-error buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainHeadError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("got very old block with number {number} (highest seen was {highest})")]
    VeryOldHead { number: u64, highest: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{name} is not started")]
    NotStarted { name: String },

    #[error("{name} is stopped")]
    AlreadyStopped { name: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ChainHeadError {
    /// Returns `true` if the error was caused by the stop signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the error is a transport-level failure that the
    /// surrounding loop is expected to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Subscription(_))
    }

    /// Prefix the message with `context`, keeping the variant.
    pub fn context(self, context: &str) -> Self {
        match self {
            Self::Rpc(msg) => Self::Rpc(format!("{context}: {msg}")),
            Self::Storage(msg) => Self::Storage(format!("{context}: {msg}")),
            Self::Subscription(msg) => Self::Subscription(format!("{context}: {msg}")),
            Self::Other(msg) => Self::Other(format!("{context}: {msg}")),
            other => other,
        }
    }
}
