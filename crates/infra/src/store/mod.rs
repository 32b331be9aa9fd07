//! Transactional storage boundary for settlement state.
//!
//! Every settlement operation opens one `StoreTx`, performs all of its reads
//! and conditional writes through it, then commits. Dropping a transaction
//! without committing discards every write made through it.
//!
//! Conditional writes (`update_purse_if_version`, `update_investment_amount`,
//! `advance_growth_job`, `settle_withdrawal`) report whether a row matched
//! instead of failing, so callers decide between retrying and treating the
//! call as a no-op.

pub mod in_memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use vaultledger_core::{
    BasketId, GrowthJobId, InvestmentId, PurseId, ReferralBonusId, UserId, WithdrawalId,
};
use vaultledger_investments::{Basket, GrowthEarning, GrowthJob, GrowthWindow, Investment};
use vaultledger_ledger::{LedgerEntry, Purse, PurseKind};
use vaultledger_referrals::{ReferralBonus, UplineLabel, UserAccount};
use vaultledger_withdrawals::WithdrawalRequest;

use crate::error::StoreResult;

pub use in_memory::{InMemorySettlementStore, InMemoryTx};
pub use postgres::{PgSettlementStore, PgTx};

/// Natural key of a purse: exactly one per user and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PurseKey {
    pub user_id: UserId,
    pub kind: PurseKind,
}

impl PurseKey {
    pub fn new(user_id: UserId, kind: PurseKind) -> Self {
        Self { user_id, kind }
    }

    pub fn main(user_id: UserId) -> Self {
        Self::new(user_id, PurseKind::Main)
    }

    pub fn trade(user_id: UserId) -> Self {
        Self::new(user_id, PurseKind::Trade)
    }

    pub fn bonus(user_id: UserId) -> Self {
        Self::new(user_id, PurseKind::Bonus)
    }
}

/// A store that can open settlement transactions.
#[async_trait::async_trait]
pub trait SettlementStore: Send + Sync {
    type Tx: StoreTx;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// One all-or-nothing unit of settlement work.
#[async_trait::async_trait]
pub trait StoreTx: Send {
    // Purses and their log.

    async fn find_purse(&mut self, key: PurseKey) -> StoreResult<Option<Purse>>;

    async fn insert_purse(&mut self, purse: &Purse) -> StoreResult<()>;

    /// Set `amount` and `version` only if the stored version is still
    /// `expected_version`.
    async fn update_purse_if_version(
        &mut self,
        purse_id: PurseId,
        expected_version: u64,
        amount: Decimal,
        version: u64,
    ) -> StoreResult<bool>;

    async fn append_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    /// Entries of one purse in sequence order.
    async fn list_entries(&mut self, purse_id: PurseId) -> StoreResult<Vec<LedgerEntry>>;

    // Users and the referral tree.

    async fn insert_user(&mut self, user: &UserAccount) -> StoreResult<()>;

    async fn find_user(&mut self, user_id: UserId) -> StoreResult<Option<UserAccount>>;

    async fn find_user_by_label(&mut self, label: &UplineLabel) -> StoreResult<Option<UserAccount>>;

    /// Users sitting exactly `level` levels below `label`.
    async fn count_descendants_at(&mut self, label: &UplineLabel, level: usize) -> StoreResult<u64>;

    // Baskets and investments.

    async fn insert_basket(&mut self, basket: &Basket) -> StoreResult<()>;

    async fn find_basket(&mut self, basket_id: BasketId) -> StoreResult<Option<Basket>>;

    async fn list_baskets(&mut self) -> StoreResult<Vec<Basket>>;

    async fn insert_investment(&mut self, investment: &Investment) -> StoreResult<()>;

    async fn find_investment(&mut self, investment_id: InvestmentId) -> StoreResult<Option<Investment>>;

    /// Persist status, `closed_at` and `switched_to`. The running amount is
    /// only written by `update_investment_amount`.
    async fn save_investment_status(&mut self, investment: &Investment) -> StoreResult<()>;

    /// Set the running amount only if it still equals `expected`.
    async fn update_investment_amount(
        &mut self,
        investment_id: InvestmentId,
        expected: Decimal,
        amount: Decimal,
    ) -> StoreResult<bool>;

    /// Whether the user holds any investment that was not switched away.
    async fn has_investments(&mut self, user_id: UserId) -> StoreResult<bool>;

    async fn count_growth_population(
        &mut self,
        basket_id: BasketId,
        window: &GrowthWindow,
    ) -> StoreResult<u64>;

    /// Population members ordered by investment id.
    async fn growth_population_page(
        &mut self,
        basket_id: BasketId,
        window: &GrowthWindow,
        offset: u64,
        limit: usize,
    ) -> StoreResult<Vec<Investment>>;

    // Growth jobs.

    /// Fails with `Conflict` if a job already exists for the basket and month.
    async fn insert_growth_job(&mut self, job: &GrowthJob) -> StoreResult<()>;

    async fn find_growth_job(&mut self, job_id: GrowthJobId) -> StoreResult<Option<GrowthJob>>;

    async fn growth_job_exists(&mut self, basket_id: BasketId, month: u32, year: i32) -> StoreResult<bool>;

    /// Jobs whose cursor is still short of `affected`, oldest first.
    async fn list_incomplete_growth_jobs(&mut self) -> StoreResult<Vec<GrowthJob>>;

    /// Move the cursor only if it still equals `expected_processed`.
    async fn advance_growth_job(
        &mut self,
        job_id: GrowthJobId,
        expected_processed: u64,
        processed: u64,
    ) -> StoreResult<bool>;

    /// Fails with `Conflict` on a second earning for the same job and
    /// investment.
    async fn insert_growth_earning(&mut self, earning: &GrowthEarning) -> StoreResult<()>;

    async fn list_growth_earnings(&mut self, job_id: GrowthJobId) -> StoreResult<Vec<GrowthEarning>>;

    // Withdrawals.

    async fn insert_withdrawal(&mut self, request: &WithdrawalRequest) -> StoreResult<()>;

    async fn find_withdrawal(&mut self, withdrawal_id: WithdrawalId) -> StoreResult<Option<WithdrawalRequest>>;

    /// Every pending request, earliest batch first.
    async fn list_pending_withdrawals(&mut self) -> StoreResult<Vec<WithdrawalRequest>>;

    /// Sum of the user's pending withdrawal amounts.
    async fn pending_withdrawal_total(&mut self, user_id: UserId) -> StoreResult<Decimal>;

    /// Write the settled state only if the stored request is still pending.
    async fn settle_withdrawal(&mut self, request: &WithdrawalRequest) -> StoreResult<bool>;

    // Referral bonuses.

    async fn insert_bonus(&mut self, bonus: &ReferralBonus) -> StoreResult<()>;

    async fn list_bonuses_of(&mut self, beneficiary: UserId) -> StoreResult<Vec<ReferralBonus>>;

    /// Up to `limit` distinct beneficiaries with locked bonuses due at `now`,
    /// ordered by user id.
    async fn due_bonus_users(&mut self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<UserId>>;

    /// Flip every locked bonus of `user_id` due at `now` and return exactly
    /// the rows that were flipped.
    async fn unlock_due_bonuses(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(ReferralBonusId, Decimal)>>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}
