//! Infrastructure and service-boundary errors.
//!
//! `StoreError` covers the storage seam, `ChainError` the payout client, and
//! `SettlementError` is what every settlement operation returns.

use rust_decimal::Decimal;
use thiserror::Error;

use vaultledger_core::{DomainError, GrowthJobId};

use crate::jobs::JobStoreError;

/// Storage operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (duplicate row or a
    /// concurrent writer got there first).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A row the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Connection, IO or any other backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure reported by the chain client. The payout may be retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain rejected payout: {0}")]
    Rejected(String),

    #[error("chain unavailable: {0}")]
    Unavailable(String),

    /// The payout serializer stopped, or the queued executor never finished.
    #[error("payout queue closed")]
    QueueClosed,
}

/// Error returned by settlement operations.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Zero, negative or malformed amount. Nothing was written.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The source purse cannot cover the request. Nothing was written.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },

    /// The growth population changed since the job was created.
    #[error("population drift on growth job {job}: expected {expected}, found {actual}")]
    PopulationDrift {
        job: GrowthJobId,
        expected: u64,
        actual: u64,
    },

    /// Payout failed on chain; the withdrawal stays pending.
    #[error("chain execution failed: {0}")]
    Chain(#[from] ChainError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Domain(DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job scheduling failed: {0}")]
    Jobs(#[from] JobStoreError),
}

impl SettlementError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<DomainError> for SettlementError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidAmount(msg) => SettlementError::InvalidAmount(msg),
            DomainError::InsufficientFunds {
                available,
                requested,
            } => SettlementError::InsufficientFunds {
                available,
                requested,
            },
            other => SettlementError::Domain(other),
        }
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn domain_money_errors_surface_as_settlement_variants() {
        let err: SettlementError = DomainError::insufficient_funds(dec!(1), dec!(2)).into();
        assert!(matches!(
            err,
            SettlementError::InsufficientFunds { available, requested }
                if available == dec!(1) && requested == dec!(2)
        ));

        let err: SettlementError = DomainError::invalid_amount("zero").into();
        assert!(matches!(err, SettlementError::InvalidAmount(_)));

        let err: SettlementError = DomainError::validation("bad").into();
        assert!(matches!(err, SettlementError::Domain(DomainError::Validation(_))));
    }
}
