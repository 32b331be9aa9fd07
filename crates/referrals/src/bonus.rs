use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vaultledger_core::{DomainError, DomainResult, ReferralBonusId, UserId, round_money};

use crate::tree::UserAccount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralBonusKind {
    Investment,
}

impl ReferralBonusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReferralBonusKind::Investment => "investment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "investment" => Some(ReferralBonusKind::Investment),
            _ => None,
        }
    }
}

/// A bonus owed to a referrer for something a referred user did.
///
/// `unlocked` flips from `false` to `true` exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralBonus {
    pub id: ReferralBonusId,
    pub kind: ReferralBonusKind,
    pub beneficiary_user_id: UserId,
    pub referred_user_id: UserId,
    pub source_entity_id: Uuid,
    pub amount: Decimal,
    pub percent: Decimal,
    pub level: u32,
    pub unlocked: bool,
    pub unlock_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ReferralBonus {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.unlocked && self.unlock_at <= now
    }

    pub fn unlock(&mut self) -> DomainResult<()> {
        if self.unlocked {
            return Err(DomainError::conflict(format!(
                "referral bonus {} already unlocked",
                self.id
            )));
        }
        self.unlocked = true;
        Ok(())
    }
}

/// How bonuses are sized and when they mature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusPolicy {
    /// Percent of the invested amount paid to the direct referrer.
    pub investment_percent: Decimal,
    /// Referrers younger than this (in days) receive locked bonuses.
    pub days_to_unlock: i64,
}

impl Default for BonusPolicy {
    fn default() -> Self {
        Self {
            investment_percent: Decimal::TWO,
            days_to_unlock: 90,
        }
    }
}

impl BonusPolicy {
    /// Bonus for `referrer` on an investment made by `referred`.
    ///
    /// Returns `None` when the bonus rounds to zero.
    pub fn investment_bonus(
        &self,
        referrer: &UserAccount,
        referred: UserId,
        investment_id: Uuid,
        invested: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ReferralBonus> {
        let amount = round_money(invested * self.investment_percent / Decimal::ONE_HUNDRED);
        if amount <= Decimal::ZERO {
            return None;
        }
        let (unlocked, unlock_at) = self.maturity(referrer, now);
        Some(ReferralBonus {
            id: ReferralBonusId::new(),
            kind: ReferralBonusKind::Investment,
            beneficiary_user_id: referrer.id,
            referred_user_id: referred,
            source_entity_id: investment_id,
            amount,
            percent: self.investment_percent,
            level: 1,
            unlocked,
            unlock_at,
            created_at: now,
        })
    }

    /// Whether a new bonus for `referrer` is born unlocked, and when it
    /// unlocks otherwise (start of the day the referrer matures).
    pub fn maturity(&self, referrer: &UserAccount, now: DateTime<Utc>) -> (bool, DateTime<Utc>) {
        let days = referrer.days_since_joined(now);
        if days > self.days_to_unlock {
            return (true, now);
        }
        let due = now + Duration::days(self.days_to_unlock - days);
        let start = Utc.from_utc_datetime(&due.date_naive().and_time(NaiveTime::MIN));
        (false, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn referrer_joined(days_ago: i64, now: DateTime<Utc>) -> UserAccount {
        UserAccount::register(None, now - Duration::days(days_ago))
    }

    #[test]
    fn mature_referrer_gets_unlocked_bonus() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 15, 30, 0).unwrap();
        let referrer = referrer_joined(91, now);
        let bonus = BonusPolicy::default()
            .investment_bonus(&referrer, UserId::new(), Uuid::now_v7(), dec!(1234.56), now)
            .unwrap();

        assert!(bonus.unlocked);
        assert_eq!(bonus.amount, dec!(24.69));
        assert_eq!(bonus.level, 1);
        assert_eq!(bonus.beneficiary_user_id, referrer.id);
    }

    #[test]
    fn young_referrer_bonus_unlocks_at_start_of_maturity_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 15, 30, 0).unwrap();
        let referrer = referrer_joined(30, now);
        let bonus = BonusPolicy::default()
            .investment_bonus(&referrer, UserId::new(), Uuid::now_v7(), dec!(100), now)
            .unwrap();

        assert!(!bonus.unlocked);
        assert_eq!(bonus.unlock_at, Utc.with_ymd_and_hms(2024, 7, 9, 0, 0, 0).unwrap());
        assert!(!bonus.is_due(now));
        assert!(bonus.is_due(bonus.unlock_at));
    }

    #[test]
    fn exactly_at_threshold_is_still_locked() {
        let now = Utc::now();
        let (unlocked, _) = BonusPolicy::default().maturity(&referrer_joined(90, now), now);
        assert!(!unlocked);
    }

    #[test]
    fn tiny_investments_yield_no_bonus() {
        let now = Utc::now();
        let referrer = referrer_joined(200, now);
        assert!(
            BonusPolicy::default()
                .investment_bonus(&referrer, UserId::new(), Uuid::now_v7(), dec!(0.2), now)
                .is_none()
        );
    }

    #[test]
    fn unlock_happens_once() {
        let now = Utc::now();
        let mut bonus = BonusPolicy::default()
            .investment_bonus(&referrer_joined(1, now), UserId::new(), Uuid::now_v7(), dec!(50), now)
            .unwrap();
        bonus.unlock().unwrap();
        assert!(matches!(bonus.unlock(), Err(DomainError::Conflict(_))));
    }
}
