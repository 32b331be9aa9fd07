//! Paired debit and credit between two purses of one user.
//!
//! The caller owns the transaction, so a transfer commits or rolls back
//! together with whatever business write it belongs to.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use vaultledger_core::{DomainError, UserId, ensure_positive};
use vaultledger_ledger::{EntryContext, LedgerEntry, PurseKind};

use crate::error::{SettlementError, SettlementResult};
use crate::ledger_store::PurseLedger;
use crate::store::{PurseKey, StoreTx};

/// The two entries a transfer wrote.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

struct Leg {
    kind: PurseKind,
    context: EntryContext,
}

#[derive(Debug, Clone, Default)]
pub struct TransferCoordinator {
    ledger: PurseLedger,
}

impl TransferCoordinator {
    pub fn new(ledger: PurseLedger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &PurseLedger {
        &self.ledger
    }

    /// Spendable balance of a purse. Main is reduced by the user's pending
    /// withdrawal requests.
    pub async fn usable_balance<T: StoreTx>(
        &self,
        tx: &mut T,
        user_id: UserId,
        kind: PurseKind,
    ) -> SettlementResult<Decimal> {
        let gross = self.ledger.balance(tx, PurseKey::new(user_id, kind)).await?;
        match kind {
            PurseKind::Main => Ok(gross - tx.pending_withdrawal_total(user_id).await?),
            PurseKind::Trade | PurseKind::Bonus => Ok(gross),
        }
    }

    /// Fail with `InsufficientFunds` unless the usable balance covers `amount`.
    pub async fn ensure_usable<T: StoreTx>(
        &self,
        tx: &mut T,
        user_id: UserId,
        kind: PurseKind,
        amount: Decimal,
    ) -> SettlementResult<()> {
        let usable = self.usable_balance(tx, user_id, kind).await?;
        if usable < amount {
            return Err(DomainError::insufficient_funds(usable, amount).into());
        }
        Ok(())
    }

    /// Fund an investment.
    pub async fn transfer_main_to_trade<T: StoreTx>(
        &self,
        tx: &mut T,
        user_id: UserId,
        amount: Decimal,
        related_entity_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> SettlementResult<TransferReceipt> {
        let from = Leg {
            kind: PurseKind::Main,
            context: EntryContext::Investment,
        };
        let to = Leg {
            kind: PurseKind::Trade,
            context: EntryContext::Investment,
        };
        self.transfer(tx, user_id, from, to, amount, related_entity_id, at).await
    }

    /// Return a redeemed investment to Main.
    pub async fn transfer_trade_to_main<T: StoreTx>(
        &self,
        tx: &mut T,
        user_id: UserId,
        amount: Decimal,
        related_entity_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> SettlementResult<TransferReceipt> {
        let from = Leg {
            kind: PurseKind::Trade,
            context: EntryContext::Withdrawal,
        };
        let to = Leg {
            kind: PurseKind::Main,
            context: EntryContext::TradeWithdrawal,
        };
        self.transfer(tx, user_id, from, to, amount, related_entity_id, at).await
    }

    /// Move unlocked referral earnings to Main.
    pub async fn transfer_bonus_to_main<T: StoreTx>(
        &self,
        tx: &mut T,
        user_id: UserId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> SettlementResult<TransferReceipt> {
        let from = Leg {
            kind: PurseKind::Bonus,
            context: EntryContext::Withdrawal,
        };
        let to = Leg {
            kind: PurseKind::Main,
            context: EntryContext::BonusWithdrawal,
        };
        self.transfer(tx, user_id, from, to, amount, None, at).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer<T: StoreTx>(
        &self,
        tx: &mut T,
        user_id: UserId,
        from: Leg,
        to: Leg,
        amount: Decimal,
        related_entity_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> SettlementResult<TransferReceipt> {
        let amount = ensure_positive(amount).map_err(SettlementError::from)?;
        self.ensure_usable(tx, user_id, from.kind, amount).await?;

        let credit = self
            .ledger
            .credit(tx, PurseKey::new(user_id, to.kind), amount, to.context, related_entity_id, at)
            .await?;
        let debit = self
            .ledger
            .debit(tx, PurseKey::new(user_id, from.kind), amount, from.context, related_entity_id, at)
            .await?;

        debug!(
            user_id = %user_id,
            from = %from.kind,
            to = %to.kind,
            %amount,
            "transfer posted"
        );
        Ok(TransferReceipt { debit, credit })
    }
}
