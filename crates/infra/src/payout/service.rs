//! Withdrawal requests and their payout jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{Instrument, Span, error, info, instrument, warn};
use uuid::Uuid;

use vaultledger_core::{DomainError, UserId, WithdrawalId};
use vaultledger_ledger::{EntryContext, PurseKind};
use vaultledger_withdrawals::{PayoutAddress, WithdrawalRequest};

use super::chain::ChainClient;
use super::serializer::PayoutSerializer;
use crate::clock::Clock;
use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::jobs::{JobScheduler, run_with_retry};
use crate::ledger_store::PurseLedger;
use crate::store::{PurseKey, SettlementStore, StoreTx};
use crate::transfer::TransferCoordinator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Processed { tx_hash: Option<String> },
    /// The request is missing or already settled.
    Skipped,
    /// Paid on chain but the settlement write kept failing. The request is
    /// left pending for an operator; it must not be paid again.
    Unsettled { tx_hash: Option<String> },
}

pub struct PayoutService<S> {
    store: S,
    transfers: TransferCoordinator,
    chain: Arc<dyn ChainClient>,
    serializer: PayoutSerializer,
    scheduler: JobScheduler,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl<S: Clone> Clone for PayoutService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transfers: self.transfers.clone(),
            chain: self.chain.clone(),
            serializer: self.serializer.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: SettlementStore + Clone + 'static> PayoutService<S> {
    pub fn new(
        store: S,
        ledger: PurseLedger,
        chain: Arc<dyn ChainClient>,
        serializer: PayoutSerializer,
        scheduler: JobScheduler,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            transfers: TransferCoordinator::new(ledger),
            chain,
            serializer,
            scheduler,
            clock,
            config,
        }
    }

    fn ledger(&self) -> &PurseLedger {
        self.transfers.ledger()
    }

    /// Reserve part of the user's Main balance for the next payout batch.
    #[instrument(skip(self, address), fields(user_id = %user_id), err)]
    pub async fn create_withdrawal_request(
        &self,
        user_id: UserId,
        address: &str,
        amount: Decimal,
    ) -> SettlementResult<WithdrawalRequest> {
        let now = self.clock.now();
        let address = PayoutAddress::parse(address)?;
        let scheduled_at = self.config.resolve_schedule()?.next_resolve_time(now);
        let request = WithdrawalRequest::new(user_id, address, amount, scheduled_at, now)?;

        let mut tx = self.store.begin().await?;
        if tx.find_user(user_id).await?.is_none() {
            return Err(SettlementError::not_found(format!("user {user_id}")));
        }
        self.transfers
            .ensure_usable(&mut tx, user_id, PurseKind::Main, request.amount)
            .await?;
        tx.insert_withdrawal(&request).await?;
        tx.commit().await?;

        self.scheduler.schedule_payout(
            request.id,
            now,
            scheduled_at,
            self.config.payout_retry_policy(),
        )?;
        info!(
            withdrawal_id = %request.id,
            amount = %request.amount,
            %scheduled_at,
            "withdrawal requested"
        );
        Ok(request)
    }

    /// Pay a pending withdrawal out and settle it.
    ///
    /// The whole check, pay and settle sequence runs inside the payout
    /// serializer, so a second delivery of the same withdrawal queues behind
    /// the first and finds it settled. A chain failure leaves the request
    /// pending and is returned so the job retry policy can run it again.
    /// Once the chain has paid, the outcome is never an error.
    #[instrument(skip(self), fields(withdrawal_id = %withdrawal_id), err)]
    pub async fn run_payout_job(&self, withdrawal_id: WithdrawalId) -> SettlementResult<PayoutOutcome> {
        let service = self.clone();
        let span = Span::current();
        self.serializer
            .submit(move || async move { service.pay_and_settle(withdrawal_id).instrument(span).await })
            .await?
    }

    /// Re-enqueue a payout job for every pending withdrawal, at its batch
    /// time. Used on startup; a request that is already queued is skipped by
    /// whichever delivery runs second.
    #[instrument(skip(self), err)]
    pub async fn resume_pending_payouts(&self) -> SettlementResult<usize> {
        let pending = {
            let mut tx = self.store.begin().await?;
            tx.list_pending_withdrawals().await?
        };
        let now = self.clock.now();
        for request in &pending {
            self.scheduler.schedule_payout(
                request.id,
                now,
                request.scheduled_at,
                self.config.payout_retry_policy(),
            )?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "pending payouts re-enqueued");
        }
        Ok(pending.len())
    }

    async fn pay_and_settle(&self, withdrawal_id: WithdrawalId) -> SettlementResult<PayoutOutcome> {
        let request = {
            let mut tx = self.store.begin().await?;
            let Some(request) = tx.find_withdrawal(withdrawal_id).await? else {
                warn!("withdrawal not found, skipping payout");
                return Ok(PayoutOutcome::Skipped);
            };
            if !request.is_pending() {
                info!(status = request.status.as_str(), "withdrawal already settled");
                return Ok(PayoutOutcome::Skipped);
            }
            let main = self.ledger().balance(&mut tx, PurseKey::main(request.user_id)).await?;
            if main < request.amount {
                return Err(SettlementError::InsufficientFunds {
                    available: main,
                    requested: request.amount,
                });
            }
            tx.rollback().await?;
            request
        };

        let receipt = self
            .chain
            .payout(&request.address, request.amount)
            .await
            .inspect_err(|e| warn!(error = %e, "chain payout failed, request stays pending"))?;

        let policy = self.config.settlement_retry_policy();
        let settled = match run_with_retry(&policy, "settle_withdrawal", || {
            self.settle_processed(withdrawal_id, receipt.tx_hash.clone(), self.clock.now())
        })
        .await
        {
            Ok(settled) => settled,
            Err(e) => {
                error!(error = %e, tx_hash = ?receipt.tx_hash, "payout executed on chain but settlement failed");
                return Ok(PayoutOutcome::Unsettled {
                    tx_hash: receipt.tx_hash,
                });
            }
        };

        if !settled {
            warn!("withdrawal settled concurrently after payout");
            return Ok(PayoutOutcome::Skipped);
        }
        info!(tx_hash = ?receipt.tx_hash, "withdrawal processed");
        Ok(PayoutOutcome::Processed {
            tx_hash: receipt.tx_hash,
        })
    }

    /// Pending -> Processed and the Main debit, together.
    async fn settle_processed(
        &self,
        withdrawal_id: WithdrawalId,
        tx_hash: Option<String>,
        at: DateTime<Utc>,
    ) -> SettlementResult<bool> {
        let mut tx = self.store.begin().await?;
        let Some(mut request) = tx.find_withdrawal(withdrawal_id).await? else {
            return Err(SettlementError::not_found(format!("withdrawal {withdrawal_id}")));
        };
        if !request.is_pending() {
            return Ok(false);
        }
        request.mark_processed(tx_hash, at)?;
        if !tx.settle_withdrawal(&request).await? {
            return Ok(false);
        }
        self.ledger()
            .debit(
                &mut tx,
                PurseKey::main(request.user_id),
                request.amount,
                EntryContext::Withdrawal,
                Some(Uuid::from(request.id)),
                at,
            )
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Operator action: give up on a pending request and release its
    /// reservation. Never called by the payout job itself, since a failed
    /// attempt may still have reached the chain.
    #[instrument(skip(self, reason), fields(withdrawal_id = %withdrawal_id), err)]
    pub async fn mark_withdrawal_failed(
        &self,
        withdrawal_id: WithdrawalId,
        reason: &str,
    ) -> SettlementResult<WithdrawalRequest> {
        let mut tx = self.store.begin().await?;
        let mut request = tx
            .find_withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("withdrawal {withdrawal_id}")))?;
        request.mark_failed(reason, self.clock.now())?;
        if !tx.settle_withdrawal(&request).await? {
            return Err(DomainError::conflict(format!(
                "withdrawal {withdrawal_id} is no longer pending"
            ))
            .into());
        }
        tx.commit().await?;
        warn!(reason, "withdrawal marked failed");
        Ok(request)
    }

    pub async fn find_withdrawal(&self, withdrawal_id: WithdrawalId) -> SettlementResult<Option<WithdrawalRequest>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.find_withdrawal(withdrawal_id).await?)
    }
}
