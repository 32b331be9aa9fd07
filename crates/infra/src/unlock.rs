//! Referral bonus unlock engine.
//!
//! Each page takes up to `unlock_page_size` users with locked bonuses due at
//! the pass's start time, flips their due rows and credits each user's Bonus
//! purse once with exactly the sum of the rows flipped. Settled users drop
//! out of the selection, so the next page needs no offset.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use vaultledger_ledger::EntryContext;

use crate::clock::Clock;
use crate::config::SettlementConfig;
use crate::error::SettlementResult;
use crate::ledger_store::PurseLedger;
use crate::store::{PurseKey, SettlementStore, StoreTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnlockReport {
    pub pages: u32,
    pub users: usize,
    pub bonuses: usize,
    pub total: Decimal,
}

pub struct UnlockEngine<S> {
    store: S,
    ledger: PurseLedger,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl<S: Clone> Clone for UnlockEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: SettlementStore> UnlockEngine<S> {
    pub fn new(store: S, ledger: PurseLedger, clock: Arc<dyn Clock>, config: SettlementConfig) -> Self {
        Self {
            store,
            ledger,
            clock,
            config,
        }
    }

    /// Unlock every bonus due now, one transaction per page of users.
    #[instrument(skip(self), err)]
    pub async fn run_unlock_pass(&self) -> SettlementResult<UnlockReport> {
        let now = self.clock.now();
        let page_size = self.config.referral.unlock_page_size.max(1);
        let mut report = UnlockReport::default();

        loop {
            let mut tx = self.store.begin().await?;
            let users = tx.due_bonus_users(now, page_size).await?;

            for user_id in &users {
                let unlocked = tx.unlock_due_bonuses(*user_id, now).await?;
                let sum: Decimal = unlocked.iter().map(|(_, amount)| *amount).sum();
                if sum > Decimal::ZERO {
                    self.ledger
                        .credit(&mut tx, PurseKey::bonus(*user_id), sum, EntryContext::Unlock, None, now)
                        .await?;
                }
                debug!(user_id = %user_id, bonuses = unlocked.len(), %sum, "bonuses unlocked");
                report.bonuses += unlocked.len();
                report.total += sum;
            }

            tx.commit().await?;
            report.pages += 1;
            report.users += users.len();

            if users.len() < page_size {
                break;
            }
        }

        info!(
            pages = report.pages,
            users = report.users,
            bonuses = report.bonuses,
            total = %report.total,
            "unlock pass finished"
        );
        Ok(report)
    }
}
