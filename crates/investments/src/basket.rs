use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultledger_core::{BasketId, DomainError, DomainResult};

/// Investment product tier. Growth is declared per basket per month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basket {
    pub id: BasketId,
    pub tier: u8,
    pub min_amount: Decimal,
    /// `None` means no upper bound.
    pub max_amount: Option<Decimal>,
}

impl Basket {
    pub fn new(tier: u8, min_amount: Decimal, max_amount: Option<Decimal>) -> Self {
        Self {
            id: BasketId::new(),
            tier,
            min_amount,
            max_amount,
        }
    }

    pub fn accepts(&self, amount: Decimal) -> bool {
        amount >= self.min_amount && self.max_amount.is_none_or(|max| amount <= max)
    }

    pub fn ensure_accepts(&self, amount: Decimal) -> DomainResult<()> {
        if self.accepts(amount) {
            return Ok(());
        }
        let upper = self
            .max_amount
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unbounded".to_string());
        Err(DomainError::invalid_amount(format!(
            "{amount} outside basket tier {} range [{}, {upper}]",
            self.tier, self.min_amount
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn range_is_inclusive_and_top_tier_unbounded() {
        let low = Basket::new(0, dec!(10), Some(dec!(499)));
        assert!(low.accepts(dec!(10)));
        assert!(low.accepts(dec!(499)));
        assert!(!low.accepts(dec!(499.01)));
        assert!(!low.accepts(dec!(9.99)));

        let top = Basket::new(3, dec!(10000), None);
        assert!(top.accepts(dec!(1000000)));
        assert!(matches!(
            top.ensure_accepts(dec!(50)),
            Err(DomainError::InvalidAmount(_))
        ));
    }
}
