//! When pending withdrawals are paid out.
//!
//! Requests are resolved in a daily batch at a fixed UTC time. A request made
//! within `cease_before` of the next batch rolls over to the following day.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

use vaultledger_core::{DomainError, DomainResult};

/// Longest accepted cut-off, 30 days.
pub const MAX_CEASE_BEFORE_HOURS: i64 = 30 * 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveSchedule {
    pub resolve_at: NaiveTime,
    pub cease_before: Duration,
}

impl ResolveSchedule {
    /// Build from a `HH:MM` (24h) string and a cut-off in hours.
    pub fn parse(resolve_time: &str, cease_before_hours: i64) -> DomainResult<Self> {
        if !(0..=MAX_CEASE_BEFORE_HOURS).contains(&cease_before_hours) {
            return Err(DomainError::validation(format!(
                "batch cease-before hours must be between 0 and {MAX_CEASE_BEFORE_HOURS}, got {cease_before_hours}"
            )));
        }
        let cease_before = Duration::try_hours(cease_before_hours).ok_or_else(|| {
            DomainError::validation(format!("batch cease-before hours out of range: {cease_before_hours}"))
        })?;
        let (hh, mm) = resolve_time
            .split_once(':')
            .filter(|(h, m)| h.len() == 2 && m.len() == 2)
            .ok_or_else(|| DomainError::validation(format!("invalid resolve time {resolve_time:?}")))?;
        let hour: u32 = hh
            .parse()
            .map_err(|_| DomainError::validation(format!("invalid resolve hour {hh:?}")))?;
        let minute: u32 = mm
            .parse()
            .map_err(|_| DomainError::validation(format!("invalid resolve minute {mm:?}")))?;
        let resolve_at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| DomainError::validation(format!("invalid resolve time {resolve_time:?}")))?;

        Ok(Self {
            resolve_at,
            cease_before,
        })
    }

    /// First batch time whose cut-off is still ahead of `now`.
    pub fn next_resolve_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = Utc.from_utc_datetime(&now.date_naive().and_time(self.resolve_at));
        while now >= candidate - self.cease_before {
            candidate += Duration::days(1);
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn rolls_over_after_cut_off() {
        let schedule = ResolveSchedule::parse("01:00", 12).unwrap();
        // Cut-off for the Mar 11 batch is Mar 10 13:00.
        assert_eq!(schedule.next_resolve_time(at(10, 12, 59)), at(11, 1, 0));
        assert_eq!(schedule.next_resolve_time(at(10, 13, 0)), at(12, 1, 0));
        assert_eq!(schedule.next_resolve_time(at(10, 0, 30)), at(11, 1, 0));
    }

    #[test]
    fn same_day_batch_when_early_enough() {
        let schedule = ResolveSchedule::parse("18:30", 2).unwrap();
        assert_eq!(schedule.next_resolve_time(at(10, 9, 0)), at(10, 18, 30));
        assert_eq!(schedule.next_resolve_time(at(10, 16, 30)), at(11, 18, 30));
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(ResolveSchedule::parse("24:00", 1).is_err());
        assert!(ResolveSchedule::parse("1:00", 1).is_err());
        assert!(ResolveSchedule::parse("01:60", 1).is_err());
        assert!(ResolveSchedule::parse("01:00", -1).is_err());
    }

    #[test]
    fn out_of_range_cut_off_is_a_validation_error() {
        for hours in [MAX_CEASE_BEFORE_HOURS + 1, i64::MAX / 1000, i64::MAX] {
            assert!(matches!(
                ResolveSchedule::parse("01:00", hours),
                Err(DomainError::Validation(_))
            ));
        }

        let longest = ResolveSchedule::parse("01:00", MAX_CEASE_BEFORE_HOURS).unwrap();
        assert_eq!(longest.next_resolve_time(at(1, 0, 0)), at(31, 1, 0));
    }
}
