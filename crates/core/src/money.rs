//! Monetary helpers.
//!
//! Amounts are arbitrary-precision decimals. Anything persisted as a balance
//! or an earning is rounded to two decimal places, half away from zero.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{DomainError, DomainResult};

/// Number of fractional digits kept for stored amounts.
pub const MONEY_SCALE: u32 = 2;

/// Round to the stored precision (half away from zero).
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Reject zero and negative amounts.
pub fn ensure_positive(amount: Decimal) -> DomainResult<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::invalid_amount(format!(
            "amount must be greater than zero (got {amount})"
        )));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
        assert_eq!(round_money(dec!(2.344)), dec!(2.34));
    }

    #[test]
    fn non_positive_amounts_are_invalid() {
        assert!(matches!(
            ensure_positive(Decimal::ZERO),
            Err(DomainError::InvalidAmount(_))
        ));
        assert!(matches!(
            ensure_positive(dec!(-0.01)),
            Err(DomainError::InvalidAmount(_))
        ));
        assert_eq!(ensure_positive(dec!(0.01)).unwrap(), dec!(0.01));
    }
}
