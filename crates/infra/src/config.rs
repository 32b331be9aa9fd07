//! Settlement configuration.
//!
//! Defaults reproduce production behaviour; the worker binary overrides
//! individual values from flags or environment.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultledger_core::DomainResult;
use vaultledger_referrals::BonusPolicy;
use vaultledger_withdrawals::ResolveSchedule;

use crate::jobs::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub growth: GrowthConfig,
    pub investment: InvestmentConfig,
    pub referral: ReferralConfig,
    pub payout: PayoutConfig,
    pub withdrawal: WithdrawalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    /// Investments processed per page transaction.
    pub page_size: usize,
    /// Day of month the reporting window opens.
    pub start_day: u32,
    /// Delay between creating a growth job and distributing it.
    pub schedule_delay: Duration,
    pub job_attempts: u32,
    pub job_backoff: Duration,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            page_size: 1,
            start_day: 1,
            schedule_delay: Duration::from_secs(24 * 60 * 60),
            job_attempts: 10,
            job_backoff: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestmentConfig {
    pub tenure_months: u32,
    /// Basket switches are allowed between these days of the month.
    pub switch_first_day: u32,
    pub switch_last_day: u32,
    /// The replacement position starts this long after the switch.
    pub switch_delay: Duration,
}

impl Default for InvestmentConfig {
    fn default() -> Self {
        Self {
            tenure_months: 3,
            switch_first_day: 1,
            switch_last_day: 5,
            switch_delay: Duration::from_secs(48 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    pub investment_bonus_percent: Decimal,
    pub days_to_unlock: i64,
    /// Users settled per unlock page transaction.
    pub unlock_page_size: usize,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            investment_bonus_percent: Decimal::TWO,
            days_to_unlock: 90,
            unlock_page_size: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutConfig {
    pub job_attempts: u32,
    pub job_backoff: Duration,
    /// Attempts at the post-receipt settlement write.
    pub settlement_attempts: u32,
    pub settlement_delay: Duration,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            job_attempts: 3,
            job_backoff: Duration::from_millis(1000),
            settlement_attempts: 3,
            settlement_delay: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Daily batch time, `HH:MM` UTC.
    pub resolve_time: String,
    /// Requests made this close to the batch roll over to the next day.
    pub batch_cease_before_hours: i64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            resolve_time: "01:00".to_string(),
            batch_cease_before_hours: 12,
        }
    }
}

const MAX_JOB_BACKOFF: Duration = Duration::from_secs(60 * 60);

impl SettlementConfig {
    pub fn bonus_policy(&self) -> BonusPolicy {
        BonusPolicy {
            investment_percent: self.referral.investment_bonus_percent,
            days_to_unlock: self.referral.days_to_unlock,
        }
    }

    pub fn resolve_schedule(&self) -> DomainResult<ResolveSchedule> {
        ResolveSchedule::parse(
            &self.withdrawal.resolve_time,
            self.withdrawal.batch_cease_before_hours,
        )
    }

    pub fn growth_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.growth.job_attempts, self.growth.job_backoff, MAX_JOB_BACKOFF)
    }

    pub fn payout_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.payout.job_attempts, self.payout.job_backoff, MAX_JOB_BACKOFF)
    }

    pub fn settlement_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.payout.settlement_attempts, self.payout.settlement_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_settings() {
        let config = SettlementConfig::default();
        assert_eq!(config.growth.page_size, 1);
        assert_eq!(config.referral.unlock_page_size, 25);
        assert_eq!(config.bonus_policy(), BonusPolicy::default());
        assert!(config.resolve_schedule().is_ok());
        assert_eq!(config.settlement_retry_policy().max_attempts, 3);
    }
}
