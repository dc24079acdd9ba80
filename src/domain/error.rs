//! Error taxonomy for the reconciliation core.
//!
//! Transient conditions (`VersionConflict`, `GatewayError::Unavailable`,
//! `DeliveryError::Transient`) are absorbed inside the engine and trigger;
//! they only surface to callers once their retry budgets are exhausted.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

/// Errors from the transaction store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Transaction already exists: {0}")]
    Duplicate(String),

    #[error("Version conflict for {reference}: expected {expected}")]
    VersionConflict { reference: String, expected: i32 },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Duplicate(db_err.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Errors from the gateway verification client
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Retry budget exhausted; the transaction is left unchanged for a
    /// later reconciliation attempt.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Gateway request timed out: {0}")]
    Timeout(String),

    #[error("Gateway rejected credentials: {0}")]
    Auth(String),

    #[error("Malformed gateway response: {0}")]
    Malformed(String),
}

/// Errors from a side-effect delivery attempt
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Timeout, 5xx, connection reset. Retried per backoff policy.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// Invalid recipient, insufficient upstream balance. Never retried.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),

    /// Another execution for the same reference is already running.
    #[error("Delivery already in flight for {0}")]
    InFlight(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Request validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Validation failed: {0}")]
    Multiple(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_classification() {
        assert!(DeliveryError::Transient("timeout".to_string()).is_transient());
        assert!(!DeliveryError::Permanent("bad recipient".to_string()).is_transient());
        assert!(!DeliveryError::InFlight("PR-1".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = AppError::Store(StoreError::VersionConflict {
            reference: "PR-1".to_string(),
            expected: 3,
        });
        assert!(err.to_string().contains("PR-1"));
        assert!(err.to_string().contains("expected 3"));

        let err = AppError::InvalidSignature;
        assert_eq!(err.to_string(), "Invalid webhook signature");
    }
}
