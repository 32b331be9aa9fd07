use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vaultledger_core::{EntryId, PurseId};

/// Side of a purse mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(Direction::Credit),
            "debit" => Some(Direction::Debit),
            _ => None,
        }
    }
}

/// Business reason attached to a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryContext {
    /// Funds arriving from the payment gateway.
    Deposit,
    /// Main → Trade when opening an investment.
    Investment,
    /// Growth applied to the Trade purse.
    InvestmentEarning,
    /// Matured referral bonuses moved into the Bonus purse.
    Unlock,
    /// Funds leaving the system (payout), or leaving Trade on redeem.
    Withdrawal,
    /// Main side of a redeem.
    TradeWithdrawal,
    /// Bonus → Main.
    BonusWithdrawal,
    /// Referral bonus credited immediately at creation.
    ReferralBonus,
}

impl EntryContext {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryContext::Deposit => "deposit",
            EntryContext::Investment => "investment",
            EntryContext::InvestmentEarning => "investment_earning",
            EntryContext::Unlock => "unlock",
            EntryContext::Withdrawal => "withdrawal",
            EntryContext::TradeWithdrawal => "trade_withdrawal",
            EntryContext::BonusWithdrawal => "bonus_withdrawal",
            EntryContext::ReferralBonus => "referral_bonus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let ctx = match s {
            "deposit" => EntryContext::Deposit,
            "investment" => EntryContext::Investment,
            "investment_earning" => EntryContext::InvestmentEarning,
            "unlock" => EntryContext::Unlock,
            "withdrawal" => EntryContext::Withdrawal,
            "trade_withdrawal" => EntryContext::TradeWithdrawal,
            "bonus_withdrawal" => EntryContext::BonusWithdrawal,
            "referral_bonus" => EntryContext::ReferralBonus,
            _ => return None,
        };
        Some(ctx)
    }
}

/// One immutable line of a purse's history.
///
/// `sequence` equals the purse version right after this write, so entries of
/// one purse are numbered 1, 2, 3, ... without gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub purse_id: PurseId,
    pub direction: Direction,
    pub context: EntryContext,
    /// Always positive; the sign comes from `direction`.
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub sequence: u64,
    pub related_entity_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Amount with the sign of its direction (credit positive).
    pub fn signed_amount(&self) -> Decimal {
        match self.direction {
            Direction::Credit => self.amount,
            Direction::Debit => -self.amount,
        }
    }
}

/// Fold a purse history from zero, in sequence order.
pub fn replay_balance<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Decimal {
    let mut ordered: Vec<&LedgerEntry> = entries.into_iter().collect();
    ordered.sort_by_key(|e| e.sequence);
    ordered
        .into_iter()
        .fold(Decimal::ZERO, |acc, e| acc + e.signed_amount())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(seq: u64, direction: Direction, amount: Decimal, after: Decimal) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::new(),
            purse_id: PurseId::new(),
            direction,
            context: EntryContext::Deposit,
            amount,
            balance_after: after,
            sequence: seq,
            related_entity_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replay_ignores_storage_order() {
        let entries = vec![
            entry(2, Direction::Debit, dec!(30), dec!(70)),
            entry(1, Direction::Credit, dec!(100), dec!(100)),
            entry(3, Direction::Credit, dec!(5.25), dec!(75.25)),
        ];
        assert_eq!(replay_balance(&entries), dec!(75.25));
    }

    #[test]
    fn context_strings_parse_back() {
        for ctx in [
            EntryContext::Deposit,
            EntryContext::Investment,
            EntryContext::InvestmentEarning,
            EntryContext::Unlock,
            EntryContext::Withdrawal,
            EntryContext::TradeWithdrawal,
            EntryContext::BonusWithdrawal,
            EntryContext::ReferralBonus,
        ] {
            assert_eq!(EntryContext::parse(ctx.as_str()), Some(ctx));
        }
        assert_eq!(EntryContext::parse("payout"), None);
    }
}
