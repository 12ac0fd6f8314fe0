//! Error types for the matching core

use thiserror::Error;

/// Matching-core error types
#[derive(Error, Debug)]
pub enum MatchError {
    /// Order not found in the store
    #[error("Order not found: {order_id}")]
    OrderNotFound {
        /// The identifier of the order that could not be found
        order_id: i64,
    },

    /// Order request failed validation
    #[error("Invalid order: {reason}")]
    InvalidOrder {
        /// Why the order was rejected
        reason: String,
    },

    /// Order is in a state that does not allow the requested transition
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The order being transitioned
        order_id: i64,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Decimal overflow or a quantity that would go negative
    #[error("Arithmetic error on order {order_id}: {details}")]
    Arithmetic {
        /// The order whose amounts could not be computed
        order_id: i64,
        /// What overflowed
        details: String,
    },

    /// Waiting-order index could not be reached
    #[error("Waiting-order index unavailable: {0}")]
    IndexUnavailable(String),

    /// Order/execution store error
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },
}

impl MatchError {
    /// Whether the failure is transient and the work should simply be
    /// attempted again on the next tick.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::IndexUnavailable(_) | Self::Store(_))
    }

    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for MatchError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Type alias for matching-core results
pub type MatchResult<T> = Result<T, MatchError>;
