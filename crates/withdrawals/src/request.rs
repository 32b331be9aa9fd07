use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultledger_core::{DomainError, DomainResult, UserId, WithdrawalId, ensure_positive, round_money};

use crate::address::PayoutAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processed => "processed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WithdrawalStatus::Pending),
            "processed" => Some(WithdrawalStatus::Processed),
            "failed" => Some(WithdrawalStatus::Failed),
            _ => None,
        }
    }
}

/// A user's request to move Main purse funds to an external address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: WithdrawalId,
    pub user_id: UserId,
    pub address: PayoutAddress,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    pub scheduled_at: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    /// New pending request. The amount is rounded to cents before validation.
    pub fn new(
        user_id: UserId,
        address: PayoutAddress,
        amount: Decimal,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let amount = ensure_positive(round_money(amount))?;
        Ok(Self {
            id: WithdrawalId::new(),
            user_id,
            address,
            amount,
            status: WithdrawalStatus::Pending,
            scheduled_at,
            tx_hash: None,
            failure_reason: None,
            processed_at: None,
            created_at,
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, WithdrawalStatus::Pending)
    }

    fn ensure_pending(&self) -> DomainResult<()> {
        if !self.is_pending() {
            return Err(DomainError::conflict(format!(
                "withdrawal {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// `tx_hash` is absent when the chain client produced no receipt.
    pub fn mark_processed(&mut self, tx_hash: Option<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_pending()?;
        self.status = WithdrawalStatus::Processed;
        self.tx_hash = tx_hash;
        self.processed_at = Some(at);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_pending()?;
        self.status = WithdrawalStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.processed_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(amount: Decimal) -> DomainResult<WithdrawalRequest> {
        let now = Utc::now();
        WithdrawalRequest::new(
            UserId::new(),
            PayoutAddress::parse("0x1111111111111111111111111111111111111111").unwrap(),
            amount,
            now,
            now,
        )
    }

    #[test]
    fn amount_is_rounded_then_validated() {
        assert_eq!(request(dec!(10.005)).unwrap().amount, dec!(10.01));
        assert!(matches!(request(dec!(0.004)), Err(DomainError::InvalidAmount(_))));
    }

    #[test]
    fn settles_exactly_once() {
        let mut req = request(dec!(500)).unwrap();
        req.mark_processed(Some("0xabc".into()), Utc::now()).unwrap();
        assert_eq!(req.status, WithdrawalStatus::Processed);
        assert_eq!(req.tx_hash.as_deref(), Some("0xabc"));

        assert!(matches!(
            req.mark_failed("late", Utc::now()),
            Err(DomainError::Conflict(_))
        ));
        assert!(req.mark_processed(None, Utc::now()).is_err());
    }
}
