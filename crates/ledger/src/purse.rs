use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vaultledger_core::{
    Aggregate, AggregateRoot, DomainError, EntryId, PurseId, UserId, ensure_positive,
};

use crate::entry::{Direction, EntryContext, LedgerEntry};

/// The three segregated balances every user owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurseKind {
    /// Spendable balance.
    Main,
    /// Invested balance.
    Trade,
    /// Referral earnings.
    Bonus,
}

impl PurseKind {
    pub const ALL: [PurseKind; 3] = [PurseKind::Main, PurseKind::Trade, PurseKind::Bonus];

    pub fn as_str(self) -> &'static str {
        match self {
            PurseKind::Main => "main",
            PurseKind::Trade => "trade",
            PurseKind::Bonus => "bonus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(PurseKind::Main),
            "trade" => Some(PurseKind::Trade),
            "bonus" => Some(PurseKind::Bonus),
            _ => None,
        }
    }
}

impl core::fmt::Display for PurseKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: Purse.
///
/// Balance is never negative. `version` is bumped by exactly one per applied
/// entry and is what conditional updates compare against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purse {
    id: PurseId,
    user_id: UserId,
    kind: PurseKind,
    amount: Decimal,
    version: u64,
}

impl Purse {
    /// Fresh, empty purse.
    pub fn open(user_id: UserId, kind: PurseKind) -> Self {
        Self {
            id: PurseId::new(),
            user_id,
            kind,
            amount: Decimal::ZERO,
            version: 0,
        }
    }

    /// Rebuild from a stored row.
    pub fn from_parts(
        id: PurseId,
        user_id: UserId,
        kind: PurseKind,
        amount: Decimal,
        version: u64,
    ) -> Result<Self, DomainError> {
        if amount < Decimal::ZERO {
            return Err(DomainError::invariant(format!(
                "purse {id} has negative balance {amount}"
            )));
        }
        Ok(Self {
            id,
            user_id,
            kind,
            amount,
            version,
        })
    }

    /// Rebuild a purse purely from its history, checking that every entry
    /// agrees with the fold so far.
    pub fn replay(
        id: PurseId,
        user_id: UserId,
        kind: PurseKind,
        entries: &[LedgerEntry],
    ) -> Result<Self, DomainError> {
        let mut purse = Self {
            id,
            user_id,
            kind,
            amount: Decimal::ZERO,
            version: 0,
        };
        let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
        ordered.sort_by_key(|e| e.sequence);

        for entry in ordered {
            if entry.purse_id != id {
                return Err(DomainError::invariant("entry belongs to another purse"));
            }
            if entry.sequence != purse.version + 1 {
                return Err(DomainError::invariant(format!(
                    "sequence gap: expected {}, found {}",
                    purse.version + 1,
                    entry.sequence
                )));
            }
            purse.apply(entry);
            if purse.amount != entry.balance_after {
                return Err(DomainError::invariant(format!(
                    "balance mismatch at sequence {}: folded {}, recorded {}",
                    entry.sequence, purse.amount, entry.balance_after
                )));
            }
            if purse.amount < Decimal::ZERO {
                return Err(DomainError::invariant("history drives balance negative"));
            }
        }

        Ok(purse)
    }

    pub fn id_typed(&self) -> PurseId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn kind(&self) -> PurseKind {
        self.kind
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

impl AggregateRoot for Purse {
    type Id = PurseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Details shared by credit and debit commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub entry_id: EntryId,
    pub amount: Decimal,
    pub context: EntryContext,
    pub related_entity_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl Posting {
    pub fn new(amount: Decimal, context: EntryContext, related_entity_id: Option<Uuid>) -> Self {
        Self {
            entry_id: EntryId::new(),
            amount,
            context,
            related_entity_id,
            occurred_at: Utc::now(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurseCommand {
    Credit(Posting),
    Debit(Posting),
}

impl Aggregate for Purse {
    type Command = PurseCommand;
    type Event = LedgerEntry;
    type Error = DomainError;

    fn apply(&mut self, entry: &Self::Event) {
        self.amount += entry.signed_amount();
        self.version = entry.sequence;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let (direction, posting) = match command {
            PurseCommand::Credit(p) => (Direction::Credit, p),
            PurseCommand::Debit(p) => (Direction::Debit, p),
        };

        let amount = ensure_positive(posting.amount)?;
        let balance_after = match direction {
            Direction::Credit => self.amount + amount,
            Direction::Debit => {
                if self.amount < amount {
                    return Err(DomainError::insufficient_funds(self.amount, amount));
                }
                self.amount - amount
            }
        };

        Ok(vec![LedgerEntry {
            id: posting.entry_id,
            purse_id: self.id,
            direction,
            context: posting.context,
            amount,
            balance_after,
            sequence: self.version + 1,
            related_entity_id: posting.related_entity_id,
            created_at: posting.occurred_at,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn main_purse() -> Purse {
        Purse::open(UserId::new(), PurseKind::Main)
    }

    fn run(purse: &mut Purse, command: PurseCommand) -> Result<LedgerEntry, DomainError> {
        let mut events = purse.handle(&command)?;
        let entry = events.remove(0);
        purse.apply(&entry);
        Ok(entry)
    }

    #[test]
    fn credit_emits_entry_with_next_sequence() {
        let mut purse = main_purse();
        let entry = run(
            &mut purse,
            PurseCommand::Credit(Posting::new(dec!(100), EntryContext::Deposit, None)),
        )
        .unwrap();

        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.balance_after, dec!(100));
        assert_eq!(entry.direction, Direction::Credit);
        assert_eq!(purse.amount(), dec!(100));
        assert_eq!(purse.version(), 1);
    }

    #[test]
    fn overdraft_is_rejected_without_state_change() {
        let mut purse = main_purse();
        run(
            &mut purse,
            PurseCommand::Credit(Posting::new(dec!(50), EntryContext::Deposit, None)),
        )
        .unwrap();

        let err = purse
            .handle(&PurseCommand::Debit(Posting::new(
                dec!(50.01),
                EntryContext::Withdrawal,
                None,
            )))
            .unwrap_err();

        assert_eq!(err, DomainError::insufficient_funds(dec!(50), dec!(50.01)));
        assert_eq!(purse.amount(), dec!(50));
        assert_eq!(purse.version(), 1);
    }

    #[test]
    fn zero_and_negative_amounts_are_invalid() {
        let purse = main_purse();
        for amount in [dec!(0), dec!(-5)] {
            let err = purse
                .handle(&PurseCommand::Credit(Posting::new(
                    amount,
                    EntryContext::Deposit,
                    None,
                )))
                .unwrap_err();
            assert!(matches!(err, DomainError::InvalidAmount(_)));
        }
    }

    #[test]
    fn debit_to_exactly_zero_is_allowed() {
        let mut purse = main_purse();
        run(
            &mut purse,
            PurseCommand::Credit(Posting::new(dec!(500), EntryContext::Deposit, None)),
        )
        .unwrap();
        let entry = run(
            &mut purse,
            PurseCommand::Debit(Posting::new(dec!(500), EntryContext::Withdrawal, None)),
        )
        .unwrap();
        assert_eq!(entry.balance_after, Decimal::ZERO);
        assert_eq!(purse.amount(), Decimal::ZERO);
    }

    #[test]
    fn replay_detects_sequence_gaps() {
        let mut purse = main_purse();
        let first = run(
            &mut purse,
            PurseCommand::Credit(Posting::new(dec!(10), EntryContext::Deposit, None)),
        )
        .unwrap();
        let mut second = run(
            &mut purse,
            PurseCommand::Credit(Posting::new(dec!(10), EntryContext::Deposit, None)),
        )
        .unwrap();
        second.sequence = 3;

        let err = Purse::replay(
            purse.id_typed(),
            purse.user_id(),
            purse.kind(),
            &[first, second],
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever mix of credits and debits is accepted, replaying
        /// the emitted entries rebuilds the exact balance and version.
        #[test]
        fn replay_reproduces_balance(
            ops in prop::collection::vec((any::<bool>(), 1i64..100_000i64), 1..40)
        ) {
            let mut purse = main_purse();
            let mut history = Vec::new();
            let mut accepted = 0u64;

            for (is_credit, cents) in ops {
                let amount = Decimal::new(cents, 2);
                let posting = Posting::new(amount, EntryContext::Deposit, None);
                let command = if is_credit {
                    PurseCommand::Credit(posting)
                } else {
                    PurseCommand::Debit(posting)
                };
                if let Ok(entry) = run(&mut purse, command) {
                    accepted += 1;
                    history.push(entry);
                }
            }

            prop_assert_eq!(purse.version(), accepted);
            prop_assert!(purse.amount() >= Decimal::ZERO);

            let rebuilt = Purse::replay(purse.id_typed(), purse.user_id(), purse.kind(), &history)
                .expect("history is consistent");
            prop_assert_eq!(rebuilt.amount(), purse.amount());
            prop_assert_eq!(crate::replay_balance(&history), purse.amount());
            if let Some(last) = history.last() {
                prop_assert_eq!(last.balance_after, purse.amount());
            }
        }
    }
}
