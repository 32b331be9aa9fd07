use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultledger_core::{BasketId, DomainError, DomainResult, InvestmentId, UserId, ensure_positive};

/// Tenures (in months) an investment may be opened with.
pub const SUPPORTED_TENURES: [u32; 1] = [3];

/// Days counted per tenure month when deciding redeemability.
const DAYS_PER_TENURE_MONTH: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentStatus {
    Active,
    Closed,
    /// Replaced by a position in another basket.
    Switched,
}

impl InvestmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvestmentStatus::Active => "active",
            InvestmentStatus::Closed => "closed",
            InvestmentStatus::Switched => "switched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(InvestmentStatus::Active),
            "closed" => Some(InvestmentStatus::Closed),
            "switched" => Some(InvestmentStatus::Switched),
            _ => None,
        }
    }
}

/// An investment position held in a user's Trade purse.
///
/// `amount` is the running value after applied growth and never goes below
/// zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investment {
    pub id: InvestmentId,
    pub user_id: UserId,
    pub basket_id: BasketId,
    pub initial_amount: Decimal,
    pub amount: Decimal,
    pub tenure_months: u32,
    pub status: InvestmentStatus,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub switched_to: Option<InvestmentId>,
}

impl Investment {
    pub fn open(
        user_id: UserId,
        basket_id: BasketId,
        amount: Decimal,
        tenure_months: u32,
        started_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let amount = ensure_positive(amount)?;
        if !SUPPORTED_TENURES.contains(&tenure_months) {
            return Err(DomainError::validation(format!(
                "unsupported investment tenure: {tenure_months} months"
            )));
        }
        Ok(Self {
            id: InvestmentId::new(),
            user_id,
            basket_id,
            initial_amount: amount,
            amount,
            tenure_months,
            status: InvestmentStatus::Active,
            started_at,
            closed_at: None,
            switched_to: None,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, InvestmentStatus::Active)
    }

    /// Redeemable once active for strictly more than the tenure.
    pub fn ensure_redeemable(&self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::validation(
                "redeem is permitted for active investments only",
            ));
        }
        let held = (now - self.started_at).num_days();
        let required = i64::from(self.tenure_months) * DAYS_PER_TENURE_MONTH;
        if held <= required {
            return Err(DomainError::validation(format!(
                "redeem is permitted after {required} days (held {held})"
            )));
        }
        Ok(())
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.status = InvestmentStatus::Closed;
        self.closed_at = Some(at);
    }

    /// Open the replacement position in `basket_id` and mark this one switched.
    pub fn switch_to(
        &mut self,
        basket_id: BasketId,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> DomainResult<Investment> {
        if !self.is_active() || self.started_at > now {
            return Err(DomainError::validation(
                "switch basket is permitted for active investments only",
            ));
        }
        if self.basket_id == basket_id {
            return Err(DomainError::validation("switch to the same basket"));
        }
        let replacement = Investment::open(
            self.user_id,
            basket_id,
            self.amount,
            self.tenure_months,
            now + delay,
        )?;
        self.status = InvestmentStatus::Switched;
        self.closed_at = Some(now);
        self.switched_to = Some(replacement.id);
        Ok(replacement)
    }

    /// Running amount after adding a (possibly negative) earning.
    pub fn amount_after(&self, earning: Decimal) -> DomainResult<Decimal> {
        let next = self.amount + earning;
        if self.amount < Decimal::ZERO || next < Decimal::ZERO {
            return Err(DomainError::invariant(format!(
                "investment {} amount underflow ({} + {earning})",
                self.id, self.amount
            )));
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn started(days_ago: i64, now: DateTime<Utc>) -> Investment {
        Investment::open(
            UserId::new(),
            BasketId::new(),
            dec!(100),
            3,
            now - Duration::days(days_ago),
        )
        .unwrap()
    }

    #[test]
    fn rejects_unsupported_tenure_and_non_positive_amount() {
        let now = Utc::now();
        assert!(matches!(
            Investment::open(UserId::new(), BasketId::new(), dec!(10), 6, now),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Investment::open(UserId::new(), BasketId::new(), dec!(0), 3, now),
            Err(DomainError::InvalidAmount(_))
        ));
    }

    #[test]
    fn redeem_requires_more_than_tenure_days() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(started(90, now).ensure_redeemable(now).is_err());
        assert!(started(91, now).ensure_redeemable(now).is_ok());

        let mut closed = started(120, now);
        closed.close(now);
        assert!(closed.ensure_redeemable(now).is_err());
    }

    #[test]
    fn switching_links_the_replacement() {
        let now = Utc::now();
        let mut current = started(10, now);
        let target = BasketId::new();
        let replacement = current.switch_to(target, now, Duration::hours(48)).unwrap();

        assert_eq!(current.status, InvestmentStatus::Switched);
        assert_eq!(current.switched_to, Some(replacement.id));
        assert_eq!(replacement.amount, current.amount);
        assert_eq!(replacement.started_at, now + Duration::hours(48));
        assert!(current.switch_to(target, now, Duration::zero()).is_err());
    }

    #[test]
    fn amount_after_refuses_underflow() {
        let inv = started(1, Utc::now());
        assert_eq!(inv.amount_after(dec!(-100)).unwrap(), Decimal::ZERO);
        assert!(inv.amount_after(dec!(-100.01)).is_err());
    }
}
