//! Error types for the worker pool

use std::fmt;

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was shut down before the task could be queued
    Stopped,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Stopped => write!(f, "worker pool is stopped"),
        }
    }
}

impl std::error::Error for PoolError {}
