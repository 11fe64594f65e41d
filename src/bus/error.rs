//! Error types for bus operations

use std::fmt;

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced by a message bus transport
///
/// Both variants are fatal to the task that hit them. Consumer-side
/// business failures never show up here; they are nacked instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The transport cannot accept writes
    Unavailable(String),

    /// The topic/group subscription could not be established
    Subscription(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Unavailable(msg) => write!(f, "message bus unavailable: {}", msg),
            BusError::Subscription(msg) => write!(f, "failed to subscribe: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}
