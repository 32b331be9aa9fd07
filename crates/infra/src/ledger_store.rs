//! Compare-and-swap purse mutations.
//!
//! A mutation reads the purse, lets the `Purse` aggregate decide the entry,
//! then writes the new balance only if the version it read is still current.
//! A lost race restarts the whole read-decide-write cycle. The loop has no
//! attempt ceiling; contention is expected to decay, and every lost race is
//! counted in `CasStats`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use vaultledger_core::{Aggregate, AggregateRoot, DomainError, UserId};
use vaultledger_ledger::{EntryContext, LedgerEntry, Posting, Purse, PurseCommand, PurseKind};

use crate::error::{SettlementError, SettlementResult};
use crate::store::{PurseKey, StoreTx};

/// Shared CAS counters.
#[derive(Debug, Default)]
pub struct CasStats {
    attempts: AtomicU64,
    lost_races: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CasSnapshot {
    pub attempts: u64,
    pub lost_races: u64,
}

impl CasStats {
    pub fn snapshot(&self) -> CasSnapshot {
        CasSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PurseLedger {
    stats: Arc<CasStats>,
}

impl PurseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CasSnapshot {
        self.stats.snapshot()
    }

    /// Open the three purses of a new user at zero.
    pub async fn open_purses<T: StoreTx>(&self, tx: &mut T, user_id: UserId) -> SettlementResult<()> {
        for kind in PurseKind::ALL {
            tx.insert_purse(&Purse::open(user_id, kind)).await?;
        }
        Ok(())
    }

    pub async fn balance<T: StoreTx>(&self, tx: &mut T, key: PurseKey) -> SettlementResult<Decimal> {
        Ok(load(tx, key).await?.amount())
    }

    /// Every entry of the purse in sequence order.
    pub async fn history<T: StoreTx>(&self, tx: &mut T, key: PurseKey) -> SettlementResult<Vec<LedgerEntry>> {
        let purse = load(tx, key).await?;
        Ok(tx.list_entries(purse.id_typed()).await?)
    }

    pub async fn credit<T: StoreTx>(
        &self,
        tx: &mut T,
        key: PurseKey,
        amount: Decimal,
        context: EntryContext,
        related_entity_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> SettlementResult<LedgerEntry> {
        let posting = Posting::new(amount, context, related_entity_id).at(at);
        self.mutate(tx, key, PurseCommand::Credit(posting)).await
    }

    pub async fn debit<T: StoreTx>(
        &self,
        tx: &mut T,
        key: PurseKey,
        amount: Decimal,
        context: EntryContext,
        related_entity_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> SettlementResult<LedgerEntry> {
        let posting = Posting::new(amount, context, related_entity_id).at(at);
        self.mutate(tx, key, PurseCommand::Debit(posting)).await
    }

    async fn mutate<T: StoreTx>(
        &self,
        tx: &mut T,
        key: PurseKey,
        command: PurseCommand,
    ) -> SettlementResult<LedgerEntry> {
        loop {
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let mut purse = load(tx, key).await?;
            let read_version = purse.version();
            let entry = purse
                .handle(&command)?
                .into_iter()
                .next()
                .ok_or_else(|| DomainError::invariant("purse command produced no entry"))?;
            purse.apply(&entry);

            if tx
                .update_purse_if_version(purse.id_typed(), read_version, purse.amount(), purse.version())
                .await?
            {
                tx.append_entry(&entry).await?;
                return Ok(entry);
            }

            let lost = self.stats.lost_races.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                user_id = %key.user_id,
                kind = %key.kind,
                read_version,
                lost_races = lost,
                "purse version moved, retrying"
            );
        }
    }
}

async fn load<T: StoreTx>(tx: &mut T, key: PurseKey) -> SettlementResult<Purse> {
    tx.find_purse(key)
        .await?
        .ok_or_else(|| SettlementError::not_found(format!("{} purse of user {}", key.kind, key.user_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemorySettlementStore, SettlementStore};
    use rust_decimal_macros::dec;
    use vaultledger_ledger::replay_balance;

    async fn store_with_user() -> (InMemorySettlementStore, UserId) {
        let store = InMemorySettlementStore::new();
        let user = UserId::new();
        let mut tx = store.begin().await.unwrap();
        PurseLedger::new().open_purses(&mut tx, user).await.unwrap();
        tx.commit().await.unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn credit_and_debit_write_one_entry_each() {
        let (store, user) = store_with_user().await;
        let ledger = PurseLedger::new();
        let key = PurseKey::main(user);
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let credit = ledger
            .credit(&mut tx, key, dec!(100), EntryContext::Deposit, None, now)
            .await
            .unwrap();
        let debit = ledger
            .debit(&mut tx, key, dec!(40), EntryContext::Investment, None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!((credit.sequence, debit.sequence), (1, 2));
        assert_eq!(debit.balance_after, dec!(60));

        let mut tx = store.begin().await.unwrap();
        let history = ledger.history(&mut tx, key).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(replay_balance(&history), dec!(60));
        assert_eq!(ledger.balance(&mut tx, key).await.unwrap(), dec!(60));
    }

    #[tokio::test]
    async fn overdraft_leaves_purse_untouched() {
        let (store, user) = store_with_user().await;
        let ledger = PurseLedger::new();
        let key = PurseKey::trade(user);

        let mut tx = store.begin().await.unwrap();
        ledger
            .credit(&mut tx, key, dec!(10), EntryContext::Investment, None, Utc::now())
            .await
            .unwrap();
        let err = ledger
            .debit(&mut tx, key, dec!(10.01), EntryContext::Withdrawal, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientFunds { .. }));

        let purse = tx.find_purse(key).await.unwrap().unwrap();
        assert_eq!((purse.amount(), purse.version()), (dec!(10), 1));
        assert_eq!(tx.list_entries(purse.id_typed()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (store, user) = store_with_user().await;
        let ledger = PurseLedger::new();

        let mut tx = store.begin().await.unwrap();
        for amount in [dec!(0), dec!(-5)] {
            let err = ledger
                .credit(&mut tx, PurseKey::bonus(user), amount, EntryContext::Unlock, None, Utc::now())
                .await
                .unwrap_err();
            assert!(matches!(err, SettlementError::InvalidAmount(_)));
        }
    }

    #[tokio::test]
    async fn lost_races_retry_until_the_write_lands() {
        let (store, user) = store_with_user().await;
        let ledger = PurseLedger::new();
        store.inject_cas_conflicts(3);

        let mut tx = store.begin().await.unwrap();
        let entry = ledger
            .credit(&mut tx, PurseKey::main(user), dec!(5), EntryContext::Deposit, None, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(entry.sequence, 1);
        assert_eq!(ledger.stats(), CasSnapshot { attempts: 4, lost_races: 3 });
    }

    #[tokio::test]
    async fn missing_purse_is_not_found() {
        let store = InMemorySettlementStore::new();
        let mut tx = store.begin().await.unwrap();

        let err = PurseLedger::new()
            .credit(&mut tx, PurseKey::main(UserId::new()), dec!(1), EntryContext::Deposit, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }
}
