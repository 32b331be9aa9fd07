//! Business operations over the ledger: users, deposits, investments,
//! redemptions, basket switches, bonus withdrawals and the referral tree.
//!
//! Every call runs in its own transaction and either commits completely or
//! leaves no trace.

use std::sync::Arc;

use chrono::Datelike;
use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use vaultledger_core::{BasketId, DomainError, InvestmentId, UserId, round_money};
use vaultledger_investments::{Basket, Investment};
use vaultledger_ledger::{EntryContext, LedgerEntry, PurseKind};
use vaultledger_referrals::{ReferralBonus, UserAccount};

use crate::clock::Clock;
use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::ledger_store::PurseLedger;
use crate::store::{PurseKey, SettlementStore, StoreTx};
use crate::transfer::{TransferCoordinator, TransferReceipt};

#[derive(Debug, Clone)]
pub struct InvestOutcome {
    pub investment: Investment,
    /// Bonus created for the investor's referrer, if any.
    pub referral_bonus: Option<ReferralBonus>,
}

pub struct SettlementService<S> {
    store: S,
    transfers: TransferCoordinator,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl<S: Clone> Clone for SettlementService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transfers: self.transfers.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: SettlementStore> SettlementService<S> {
    pub fn new(store: S, ledger: PurseLedger, clock: Arc<dyn Clock>, config: SettlementConfig) -> Self {
        Self {
            store,
            transfers: TransferCoordinator::new(ledger),
            clock,
            config,
        }
    }

    fn ledger(&self) -> &PurseLedger {
        self.transfers.ledger()
    }

    // Users and the referral tree.

    /// Create a user with empty Main, Trade and Bonus purses, placed below
    /// `referrer` in the referral tree.
    #[instrument(skip(self), err)]
    pub async fn register_user(&self, referrer: Option<UserId>) -> SettlementResult<UserAccount> {
        let mut tx = self.store.begin().await?;
        let referrer = match referrer {
            Some(id) => Some(user(&mut tx, id).await?),
            None => None,
        };
        let account = UserAccount::register(referrer.as_ref(), self.clock.now());
        tx.insert_user(&account).await?;
        self.ledger().open_purses(&mut tx, account.id).await?;
        tx.commit().await?;

        info!(user_id = %account.id, depth = account.upline.depth(), "user registered");
        Ok(account)
    }

    pub async fn referrer_of(&self, user_id: UserId) -> SettlementResult<Option<UserAccount>> {
        let mut tx = self.store.begin().await?;
        let account = user(&mut tx, user_id).await?;
        match account.upline.referrer() {
            Some(label) => Ok(tx.find_user_by_label(label).await?),
            None => Ok(None),
        }
    }

    /// Ancestors nearest first.
    pub async fn ancestors_of(&self, user_id: UserId) -> SettlementResult<Vec<UserAccount>> {
        let mut tx = self.store.begin().await?;
        let account = user(&mut tx, user_id).await?;
        let mut ancestors = Vec::with_capacity(account.upline.depth());
        for label in account.upline.ancestors() {
            let ancestor = tx.find_user_by_label(label).await?.ok_or_else(|| {
                SettlementError::not_found(format!("ancestor {label} of user {user_id}"))
            })?;
            ancestors.push(ancestor);
        }
        Ok(ancestors)
    }

    /// Users exactly `level` levels below `user_id` (1 = direct referrals).
    pub async fn descendant_count_at(&self, user_id: UserId, level: usize) -> SettlementResult<u64> {
        let mut tx = self.store.begin().await?;
        let account = user(&mut tx, user_id).await?;
        Ok(tx.count_descendants_at(&account.upline_label, level).await?)
    }

    pub async fn bonuses_of(&self, user_id: UserId) -> SettlementResult<Vec<ReferralBonus>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.list_bonuses_of(user_id).await?)
    }

    // Purses.

    pub async fn credit(
        &self,
        key: PurseKey,
        amount: Decimal,
        context: EntryContext,
        related_entity_id: Option<Uuid>,
    ) -> SettlementResult<LedgerEntry> {
        let mut tx = self.store.begin().await?;
        let entry = self
            .ledger()
            .credit(&mut tx, key, amount, context, related_entity_id, self.clock.now())
            .await?;
        tx.commit().await?;
        Ok(entry)
    }

    pub async fn debit(
        &self,
        key: PurseKey,
        amount: Decimal,
        context: EntryContext,
        related_entity_id: Option<Uuid>,
    ) -> SettlementResult<LedgerEntry> {
        let mut tx = self.store.begin().await?;
        let entry = self
            .ledger()
            .debit(&mut tx, key, amount, context, related_entity_id, self.clock.now())
            .await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Credit an external deposit to Main.
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: Decimal,
        reference: Option<Uuid>,
    ) -> SettlementResult<LedgerEntry> {
        self.credit(PurseKey::main(user_id), round_money(amount), EntryContext::Deposit, reference)
            .await
    }

    pub async fn transfer_main_to_trade(&self, user_id: UserId, amount: Decimal) -> SettlementResult<TransferReceipt> {
        let mut tx = self.store.begin().await?;
        let receipt = self
            .transfers
            .transfer_main_to_trade(&mut tx, user_id, round_money(amount), None, self.clock.now())
            .await?;
        tx.commit().await?;
        Ok(receipt)
    }

    pub async fn transfer_trade_to_main(&self, user_id: UserId, amount: Decimal) -> SettlementResult<TransferReceipt> {
        let mut tx = self.store.begin().await?;
        let receipt = self
            .transfers
            .transfer_trade_to_main(&mut tx, user_id, round_money(amount), None, self.clock.now())
            .await?;
        tx.commit().await?;
        Ok(receipt)
    }

    /// Move unlocked referral earnings to Main.
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    pub async fn withdraw_bonus(&self, user_id: UserId, amount: Decimal) -> SettlementResult<TransferReceipt> {
        let mut tx = self.store.begin().await?;
        let receipt = self
            .transfers
            .transfer_bonus_to_main(&mut tx, user_id, round_money(amount), self.clock.now())
            .await?;
        tx.commit().await?;
        Ok(receipt)
    }

    pub async fn balance(&self, key: PurseKey) -> SettlementResult<Decimal> {
        let mut tx = self.store.begin().await?;
        self.ledger().balance(&mut tx, key).await
    }

    pub async fn usable_balance(&self, user_id: UserId, kind: PurseKind) -> SettlementResult<Decimal> {
        let mut tx = self.store.begin().await?;
        self.transfers.usable_balance(&mut tx, user_id, kind).await
    }

    /// Entries of one purse in sequence order.
    pub async fn purse_history(&self, key: PurseKey) -> SettlementResult<Vec<LedgerEntry>> {
        let mut tx = self.store.begin().await?;
        self.ledger().history(&mut tx, key).await
    }

    // Baskets and investments.

    pub async fn add_basket(
        &self,
        tier: u8,
        min_amount: Decimal,
        max_amount: Option<Decimal>,
    ) -> SettlementResult<Basket> {
        let basket = Basket::new(tier, min_amount, max_amount);
        let mut tx = self.store.begin().await?;
        tx.insert_basket(&basket).await?;
        tx.commit().await?;
        Ok(basket)
    }

    pub async fn find_investment(&self, investment_id: InvestmentId) -> SettlementResult<Investment> {
        let mut tx = self.store.begin().await?;
        investment(&mut tx, investment_id).await
    }

    /// Open an investment funded from Main and reward the investor's referrer.
    #[instrument(skip(self), fields(user_id = %user_id, basket_id = %basket_id), err)]
    pub async fn invest(
        &self,
        user_id: UserId,
        basket_id: BasketId,
        amount: Decimal,
    ) -> SettlementResult<InvestOutcome> {
        let now = self.clock.now();
        let amount = round_money(amount);
        let mut tx = self.store.begin().await?;

        let investor = user(&mut tx, user_id).await?;
        let basket = tx
            .find_basket(basket_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("basket {basket_id}")))?;
        basket.ensure_accepts(amount)?;

        let investment = Investment::open(
            user_id,
            basket_id,
            amount,
            self.config.investment.tenure_months,
            now,
        )?;
        tx.insert_investment(&investment).await?;
        self.transfers
            .transfer_main_to_trade(&mut tx, user_id, amount, Some(investment.id.into()), now)
            .await?;

        let referral_bonus = self.reward_referrer(&mut tx, &investor, &investment).await?;
        tx.commit().await?;

        info!(
            investment_id = %investment.id,
            %amount,
            referral_bonus = referral_bonus.is_some(),
            "investment opened"
        );
        Ok(InvestOutcome {
            investment,
            referral_bonus,
        })
    }

    /// Level-1 bonus for the referrer of a fresh investment. Referrers
    /// without an investment of their own earn nothing.
    async fn reward_referrer(
        &self,
        tx: &mut S::Tx,
        investor: &UserAccount,
        investment: &Investment,
    ) -> SettlementResult<Option<ReferralBonus>> {
        let Some(label) = investor.upline.referrer() else {
            return Ok(None);
        };
        let Some(referrer) = tx.find_user_by_label(label).await? else {
            return Ok(None);
        };
        if !tx.has_investments(referrer.id).await? {
            return Ok(None);
        }

        let now = investment.started_at;
        let Some(bonus) = self.config.bonus_policy().investment_bonus(
            &referrer,
            investor.id,
            investment.id.into(),
            investment.initial_amount,
            now,
        ) else {
            return Ok(None);
        };
        tx.insert_bonus(&bonus).await?;

        if bonus.unlocked {
            self.ledger()
                .credit(
                    tx,
                    PurseKey::bonus(referrer.id),
                    bonus.amount,
                    EntryContext::ReferralBonus,
                    Some(bonus.id.into()),
                    now,
                )
                .await?;
        }
        Ok(Some(bonus))
    }

    /// Close a matured investment and return its running amount to Main.
    #[instrument(skip(self), fields(user_id = %user_id, investment_id = %investment_id), err)]
    pub async fn redeem(&self, user_id: UserId, investment_id: InvestmentId) -> SettlementResult<Investment> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut position = owned_investment(&mut tx, user_id, investment_id).await?;
        position.ensure_redeemable(now)?;
        position.close(now);
        tx.save_investment_status(&position).await?;

        if position.amount > Decimal::ZERO {
            self.transfers
                .transfer_trade_to_main(&mut tx, user_id, position.amount, Some(investment_id.into()), now)
                .await?;
        }
        tx.commit().await?;

        info!(amount = %position.amount, "investment redeemed");
        Ok(position)
    }

    /// Move an active investment to another basket.
    ///
    /// Allowed only on the configured days of the month. The replacement
    /// starts after the configured delay; funds stay in Trade and no
    /// referral bonus is paid.
    #[instrument(skip(self), fields(user_id = %user_id, investment_id = %investment_id), err)]
    pub async fn switch_basket(
        &self,
        user_id: UserId,
        investment_id: InvestmentId,
        basket_id: BasketId,
    ) -> SettlementResult<Investment> {
        let now = self.clock.now();
        let window = self.config.investment.switch_first_day..=self.config.investment.switch_last_day;
        if !window.contains(&now.day()) {
            return Err(DomainError::validation(format!(
                "basket switches are allowed on days {}-{} of the month",
                window.start(),
                window.end()
            ))
            .into());
        }
        let delay = chrono::Duration::from_std(self.config.investment.switch_delay)
            .map_err(|e| DomainError::validation(format!("invalid switch delay: {e}")))?;

        let mut tx = self.store.begin().await?;
        let mut position = owned_investment(&mut tx, user_id, investment_id).await?;
        let basket = tx
            .find_basket(basket_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("basket {basket_id}")))?;
        basket.ensure_accepts(position.amount)?;

        let replacement = position.switch_to(basket_id, now, delay)?;
        tx.save_investment_status(&position).await?;
        tx.insert_investment(&replacement).await?;
        tx.commit().await?;

        info!(replacement_id = %replacement.id, starts_at = %replacement.started_at, "basket switched");
        Ok(replacement)
    }
}

async fn user<T: StoreTx>(tx: &mut T, user_id: UserId) -> SettlementResult<UserAccount> {
    tx.find_user(user_id)
        .await?
        .ok_or_else(|| SettlementError::not_found(format!("user {user_id}")))
}

async fn investment<T: StoreTx>(tx: &mut T, investment_id: InvestmentId) -> SettlementResult<Investment> {
    tx.find_investment(investment_id)
        .await?
        .ok_or_else(|| SettlementError::not_found(format!("investment {investment_id}")))
}

async fn owned_investment<T: StoreTx>(
    tx: &mut T,
    user_id: UserId,
    investment_id: InvestmentId,
) -> SettlementResult<Investment> {
    let position = investment(tx, investment_id).await?;
    if position.user_id != user_id {
        return Err(SettlementError::not_found(format!(
            "investment {investment_id} of user {user_id}"
        )));
    }
    Ok(position)
}
