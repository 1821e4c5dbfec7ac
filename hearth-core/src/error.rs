//! Error types for Hearth operations

use crate::{Timestamp, UserId};
use thiserror::Error;

/// Key-value store errors.
///
/// Cache callers never see these: `CacheStore` logs them and degrades to a
/// miss. Locks, counters and the ledger propagate them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Store operation '{operation}' timed out")]
    Timeout { operation: String },

    #[error("Wrong value type at key {key}")]
    WrongType { key: String },

    #[error("Value at key {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Concurrent updates to key {key} did not settle")]
    Contended { key: String },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Billing provider and reconciliation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("No billing account for user {user_id}")]
    AccountMissing { user_id: UserId },

    #[error("No billing customer mapping for user {user_id}")]
    CustomerMissing { user_id: UserId },

    #[error("No metered subscription for user {user_id}")]
    SubscriptionMissing { user_id: UserId },

    #[error("Unknown price {price_id}")]
    UnknownPrice { price_id: String },

    #[error("Billing work for user {user_id} is already in progress")]
    Busy { user_id: UserId },

    #[error("Billing provider rejected request with status {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Billing provider unreachable: {reason}")]
    Transport { reason: String },

    #[error("Invalid billing provider response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Billing provider not configured")]
    NotConfigured,

    #[error("Billing storage error: {0}")]
    Store(#[from] StoreError),
}

/// Billing period arithmetic errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("Billing period ending {end} cannot be rolled forward to {now}")]
    Overflow { end: Timestamp, now: Timestamp },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Hearth errors.
#[derive(Debug, Clone, Error)]
pub enum HearthError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Hearth operations.
pub type HearthResult<T> = Result<T, HearthError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::unavailable("connection refused");
        assert_eq!(format!("{}", err), "Store unavailable: connection refused");
    }

    #[test]
    fn test_billing_error_wraps_store_error() {
        let err: BillingError = StoreError::Timeout {
            operation: "GET".to_string(),
        }
        .into();
        assert!(matches!(err, BillingError::Store(StoreError::Timeout { .. })));
        assert!(format!("{}", err).contains("timed out"));
    }

    #[test]
    fn test_hearth_error_from_variants() {
        let user_id = UserId::now_v7();
        let err: HearthError = BillingError::CustomerMissing { user_id }.into();
        let msg = format!("{}", err);
        assert!(msg.starts_with("Billing error"));
        assert!(msg.contains(&user_id.to_string()));

        let err: HearthError = ConfigError::MissingRequired {
            field: "HEARTH_STRIPE_SECRET_KEY".to_string(),
        }
        .into();
        assert!(format!("{}", err).contains("HEARTH_STRIPE_SECRET_KEY"));
    }
}
