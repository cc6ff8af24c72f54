//! Error types for the connection pool

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why an operation was refused by a pool that is not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// The pool was never opened.
    NotOpenYet,
    /// The pool was closed before the request was made.
    AlreadyClosed,
    /// The pool was closed while the request was waiting in the queue.
    ClosedWhileWaiting,
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpenYet => f.write_str("is not open yet"),
            Self::AlreadyClosed => f.write_str("is already closed"),
            Self::ClosedWhileWaiting => f.write_str("is closed"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("the pool '{name}' {reason}")]
    PoolClosed { name: String, reason: ClosedReason },

    #[error("couldn't get a connection from the pool '{name}' after {waited:?}")]
    Timeout { name: String, waited: Duration },

    #[error("the pool '{name}' has already {max_waiting} requests waiting")]
    TooManyRequests { name: String, max_waiting: usize },

    #[error("the pool '{name}' cannot be reused once closed")]
    Reuse { name: String },

    #[error("the connection does not belong to the pool '{name}'")]
    ForeignConnection { name: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::TooManyRequests { .. })
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
