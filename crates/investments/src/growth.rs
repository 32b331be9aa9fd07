//! Monthly growth distribution: jobs, earnings and the earning formula.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultledger_core::{
    BasketId, DomainError, DomainResult, GrowthEarningId, GrowthJobId, InvestmentId, UserId,
    round_money,
};

use crate::investment::{Investment, InvestmentStatus};

/// Reporting window of a growth month.
///
/// Runs from `start_day` of the month at 00:00 UTC to the last millisecond of
/// the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl GrowthWindow {
    pub fn for_month(month: u32, year: i32, start_day: u32) -> DomainResult<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, start_day).ok_or_else(|| {
            DomainError::validation(format!("invalid growth month {year}-{month} day {start_day}"))
        })?;
        let next_month = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| DomainError::validation(format!("invalid growth month {year}-{month}")))?;

        Ok(Self {
            start: start_of_day(first),
            end: start_of_day(next_month) - Duration::milliseconds(1),
        })
    }

    /// Whole days between window start and end.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Population membership: started by the end of the window and either
    /// still active or closed inside the window.
    pub fn includes(&self, investment: &Investment) -> bool {
        if investment.started_at > self.end {
            return false;
        }
        matches!(investment.status, InvestmentStatus::Active)
            || investment
                .closed_at
                .is_some_and(|closed| closed >= self.start && closed <= self.end)
    }

    /// Whole days of the window the investment earned for, floored at zero.
    ///
    /// Growth starts the day after the investment started and stops the day
    /// before it closed.
    pub fn days_held(&self, investment: &Investment) -> i64 {
        let from = if investment.started_at < self.start {
            self.start
        } else {
            start_of_day(investment.started_at.date_naive()) + Duration::days(1)
        };
        let to = match investment.closed_at {
            Some(closed) => end_of_day(closed.date_naive() - Duration::days(1)).min(self.end),
            None => self.end,
        };
        (to - from).num_days().max(0)
    }

    /// Daily growth percent, rounded to two decimals.
    pub fn growth_per_day(&self, growth_percent: Decimal) -> DomainResult<Decimal> {
        let days = self.days();
        if days <= 0 {
            return Err(DomainError::validation(
                "growth window spans less than one day",
            ));
        }
        Ok(round_money(growth_percent / Decimal::from(days)))
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + Duration::days(1) - Duration::milliseconds(1)
}

/// Earning for one investment: `amount × growthPerDay × days / 100`, rounded
/// to two decimals. A loss never takes the amount below zero.
pub fn compute_earning(amount_before: Decimal, growth_per_day: Decimal, days_held: i64) -> Decimal {
    let raw = round_money(amount_before * (growth_per_day * Decimal::from(days_held)) / Decimal::ONE_HUNDRED);
    if raw < Decimal::ZERO && amount_before + raw < Decimal::ZERO {
        -amount_before
    } else {
        raw
    }
}

/// Growth may only be declared for months that have fully elapsed.
pub fn ensure_past_month(month: u32, year: i32, now: DateTime<Utc>) -> DomainResult<()> {
    if !(1..=12).contains(&month) {
        return Err(DomainError::validation(format!("invalid month {month}")));
    }
    if (year, month) >= (now.year(), now.month()) {
        return Err(DomainError::validation(
            "growth for the current or an upcoming month is not allowed",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthJobStatus {
    Created,
    Running,
    Complete,
}

/// A growth distribution for one basket and month.
///
/// `affected` is fixed at creation; `processed` is the durable paging cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthJob {
    pub id: GrowthJobId,
    pub basket_id: BasketId,
    pub month: u32,
    pub year: i32,
    pub growth_percent: Decimal,
    pub affected: u64,
    pub processed: u64,
    pub created_at: DateTime<Utc>,
}

impl GrowthJob {
    pub fn new(
        basket_id: BasketId,
        month: u32,
        year: i32,
        growth_percent: Decimal,
        affected: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GrowthJobId::new(),
            basket_id,
            month,
            year,
            growth_percent,
            affected,
            processed: 0,
            created_at,
        }
    }

    pub fn status(&self) -> GrowthJobStatus {
        if self.processed >= self.affected {
            GrowthJobStatus::Complete
        } else if self.processed == 0 {
            GrowthJobStatus::Created
        } else {
            GrowthJobStatus::Running
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status(), GrowthJobStatus::Complete)
    }

    /// Cursor value after committing a page of `page_len` items.
    pub fn next_processed(&self, page_len: usize) -> DomainResult<u64> {
        let next = self.processed + page_len as u64;
        if next > self.affected {
            return Err(DomainError::invariant(format!(
                "growth job {} would process {next} of {} investments",
                self.id, self.affected
            )));
        }
        Ok(next)
    }
}

/// The result of applying a growth job to one investment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthEarning {
    pub id: GrowthEarningId,
    pub growth_job_id: GrowthJobId,
    pub investment_id: InvestmentId,
    pub user_id: UserId,
    pub amount_before: Decimal,
    /// Signed; negative for a loss.
    pub earning: Decimal,
    pub created_at: DateTime<Utc>,
}
