//! In-memory settlement store.
//!
//! For tests and local runs only. Transactions are serialized: `begin` takes
//! an exclusive lock and clones the whole state into a private copy, `commit`
//! swaps the copy in, dropping the transaction discards it. Each transaction
//! therefore costs a full copy of every table; production deployments use
//! the Postgres store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use vaultledger_core::{
    AggregateRoot, BasketId, GrowthJobId, InvestmentId, PurseId, ReferralBonusId, UserId,
    WithdrawalId,
};
use vaultledger_investments::{Basket, GrowthEarning, GrowthJob, GrowthWindow, Investment, InvestmentStatus};
use vaultledger_ledger::{LedgerEntry, Purse};
use vaultledger_referrals::{ReferralBonus, UplineLabel, UserAccount};
use vaultledger_withdrawals::{WithdrawalRequest, WithdrawalStatus};

use super::{PurseKey, SettlementStore, StoreTx};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct State {
    purses: HashMap<PurseId, Purse>,
    purse_keys: HashMap<PurseKey, PurseId>,
    entries: HashMap<PurseId, Vec<LedgerEntry>>,
    users: HashMap<UserId, UserAccount>,
    baskets: BTreeMap<BasketId, Basket>,
    investments: BTreeMap<InvestmentId, Investment>,
    growth_jobs: HashMap<GrowthJobId, GrowthJob>,
    growth_earnings: Vec<GrowthEarning>,
    withdrawals: HashMap<WithdrawalId, WithdrawalRequest>,
    bonuses: BTreeMap<ReferralBonusId, ReferralBonus>,
}

impl State {
    fn population<'a>(
        &'a self,
        basket_id: BasketId,
        window: &'a GrowthWindow,
    ) -> impl Iterator<Item = &'a Investment> + 'a {
        self.investments
            .values()
            .filter(move |i| i.basket_id == basket_id && window.includes(i))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySettlementStore {
    state: Arc<Mutex<State>>,
    cas_faults: Arc<AtomicU32>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` purse version checks fail as if another writer had
    /// committed first.
    pub fn inject_cas_conflicts(&self, n: u32) {
        self.cas_faults.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SettlementStore for InMemorySettlementStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> StoreResult<InMemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let working = (*guard).clone();
        Ok(InMemoryTx {
            guard,
            working,
            cas_faults: self.cas_faults.clone(),
        })
    }
}

pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    cas_faults: Arc<AtomicU32>,
}

impl InMemoryTx {
    fn take_cas_fault(&self) -> bool {
        self.cas_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl StoreTx for InMemoryTx {
    async fn find_purse(&mut self, key: PurseKey) -> StoreResult<Option<Purse>> {
        Ok(self
            .working
            .purse_keys
            .get(&key)
            .and_then(|id| self.working.purses.get(id))
            .cloned())
    }

    async fn insert_purse(&mut self, purse: &Purse) -> StoreResult<()> {
        let key = PurseKey::new(purse.user_id(), purse.kind());
        if self.working.purse_keys.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "user {} already has a {} purse",
                purse.user_id(),
                purse.kind()
            )));
        }
        self.working.purse_keys.insert(key, purse.id_typed());
        self.working.purses.insert(purse.id_typed(), purse.clone());
        Ok(())
    }

    async fn update_purse_if_version(
        &mut self,
        purse_id: PurseId,
        expected_version: u64,
        amount: Decimal,
        version: u64,
    ) -> StoreResult<bool> {
        if self.take_cas_fault() {
            return Ok(false);
        }
        let Some(current) = self.working.purses.get_mut(&purse_id) else {
            return Ok(false);
        };
        if current.version() != expected_version {
            return Ok(false);
        }
        *current = Purse::from_parts(purse_id, current.user_id(), current.kind(), amount, version)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(true)
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        let log = self.working.entries.entry(entry.purse_id).or_default();
        if log.iter().any(|e| e.sequence == entry.sequence) {
            return Err(StoreError::Conflict(format!(
                "purse {} already has entry {}",
                entry.purse_id, entry.sequence
            )));
        }
        log.push(entry.clone());
        Ok(())
    }

    async fn list_entries(&mut self, purse_id: PurseId) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries = self
            .working
            .entries
            .get(&purse_id)
            .cloned()
            .unwrap_or_default();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn insert_user(&mut self, user: &UserAccount) -> StoreResult<()> {
        if self.working.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user {} exists", user.id)));
        }
        self.working.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user(&mut self, user_id: UserId) -> StoreResult<Option<UserAccount>> {
        Ok(self.working.users.get(&user_id).cloned())
    }

    async fn find_user_by_label(&mut self, label: &UplineLabel) -> StoreResult<Option<UserAccount>> {
        Ok(self
            .working
            .users
            .values()
            .find(|u| &u.upline_label == label)
            .cloned())
    }

    async fn count_descendants_at(&mut self, label: &UplineLabel, level: usize) -> StoreResult<u64> {
        Ok(self
            .working
            .users
            .values()
            .filter(|u| u.upline.has_ancestor_at(label, level))
            .count() as u64)
    }

    async fn insert_basket(&mut self, basket: &Basket) -> StoreResult<()> {
        if self.working.baskets.values().any(|b| b.tier == basket.tier) {
            return Err(StoreError::Conflict(format!(
                "basket tier {} exists",
                basket.tier
            )));
        }
        self.working.baskets.insert(basket.id, basket.clone());
        Ok(())
    }

    async fn find_basket(&mut self, basket_id: BasketId) -> StoreResult<Option<Basket>> {
        Ok(self.working.baskets.get(&basket_id).cloned())
    }

    async fn list_baskets(&mut self) -> StoreResult<Vec<Basket>> {
        let mut baskets: Vec<Basket> = self.working.baskets.values().cloned().collect();
        baskets.sort_by_key(|b| b.tier);
        Ok(baskets)
    }

    async fn insert_investment(&mut self, investment: &Investment) -> StoreResult<()> {
        if self.working.investments.contains_key(&investment.id) {
            return Err(StoreError::Conflict(format!(
                "investment {} exists",
                investment.id
            )));
        }
        self.working
            .investments
            .insert(investment.id, investment.clone());
        Ok(())
    }

    async fn find_investment(&mut self, investment_id: InvestmentId) -> StoreResult<Option<Investment>> {
        Ok(self.working.investments.get(&investment_id).cloned())
    }

    async fn save_investment_status(&mut self, investment: &Investment) -> StoreResult<()> {
        let stored = self
            .working
            .investments
            .get_mut(&investment.id)
            .ok_or_else(|| StoreError::NotFound(format!("investment {}", investment.id)))?;
        stored.status = investment.status;
        stored.closed_at = investment.closed_at;
        stored.switched_to = investment.switched_to;
        Ok(())
    }

    async fn update_investment_amount(
        &mut self,
        investment_id: InvestmentId,
        expected: Decimal,
        amount: Decimal,
    ) -> StoreResult<bool> {
        match self.working.investments.get_mut(&investment_id) {
            Some(stored) if stored.amount == expected => {
                stored.amount = amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has_investments(&mut self, user_id: UserId) -> StoreResult<bool> {
        Ok(self
            .working
            .investments
            .values()
            .any(|i| i.user_id == user_id && i.status != InvestmentStatus::Switched))
    }

    async fn count_growth_population(
        &mut self,
        basket_id: BasketId,
        window: &GrowthWindow,
    ) -> StoreResult<u64> {
        Ok(self.working.population(basket_id, window).count() as u64)
    }

    async fn growth_population_page(
        &mut self,
        basket_id: BasketId,
        window: &GrowthWindow,
        offset: u64,
        limit: usize,
    ) -> StoreResult<Vec<Investment>> {
        Ok(self
            .working
            .population(basket_id, window)
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_growth_job(&mut self, job: &GrowthJob) -> StoreResult<()> {
        let duplicate = self.working.growth_jobs.values().any(|j| {
            j.basket_id == job.basket_id && j.month == job.month && j.year == job.year
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "growth for basket {} {}-{:02} exists",
                job.basket_id, job.year, job.month
            )));
        }
        self.working.growth_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_growth_job(&mut self, job_id: GrowthJobId) -> StoreResult<Option<GrowthJob>> {
        Ok(self.working.growth_jobs.get(&job_id).cloned())
    }

    async fn growth_job_exists(&mut self, basket_id: BasketId, month: u32, year: i32) -> StoreResult<bool> {
        Ok(self
            .working
            .growth_jobs
            .values()
            .any(|j| j.basket_id == basket_id && j.month == month && j.year == year))
    }

    async fn list_incomplete_growth_jobs(&mut self) -> StoreResult<Vec<GrowthJob>> {
        let mut jobs: Vec<GrowthJob> = self
            .working
            .growth_jobs
            .values()
            .filter(|j| !j.is_complete())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn advance_growth_job(
        &mut self,
        job_id: GrowthJobId,
        expected_processed: u64,
        processed: u64,
    ) -> StoreResult<bool> {
        match self.working.growth_jobs.get_mut(&job_id) {
            Some(job) if job.processed == expected_processed => {
                job.processed = processed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_growth_earning(&mut self, earning: &GrowthEarning) -> StoreResult<()> {
        let duplicate = self.working.growth_earnings.iter().any(|e| {
            e.growth_job_id == earning.growth_job_id && e.investment_id == earning.investment_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "earning for investment {} on growth job {} exists",
                earning.investment_id, earning.growth_job_id
            )));
        }
        self.working.growth_earnings.push(earning.clone());
        Ok(())
    }

    async fn list_growth_earnings(&mut self, job_id: GrowthJobId) -> StoreResult<Vec<GrowthEarning>> {
        let mut earnings: Vec<GrowthEarning> = self
            .working
            .growth_earnings
            .iter()
            .filter(|e| e.growth_job_id == job_id)
            .cloned()
            .collect();
        earnings.sort_by_key(|e| e.investment_id);
        Ok(earnings)
    }

    async fn insert_withdrawal(&mut self, request: &WithdrawalRequest) -> StoreResult<()> {
        if self.working.withdrawals.contains_key(&request.id) {
            return Err(StoreError::Conflict(format!("withdrawal {} exists", request.id)));
        }
        self.working.withdrawals.insert(request.id, request.clone());
        Ok(())
    }

    async fn find_withdrawal(&mut self, withdrawal_id: WithdrawalId) -> StoreResult<Option<WithdrawalRequest>> {
        Ok(self.working.withdrawals.get(&withdrawal_id).cloned())
    }

    async fn list_pending_withdrawals(&mut self) -> StoreResult<Vec<WithdrawalRequest>> {
        let mut pending: Vec<WithdrawalRequest> = self
            .working
            .withdrawals
            .values()
            .filter(|w| w.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|w| (w.scheduled_at, w.id));
        Ok(pending)
    }

    async fn pending_withdrawal_total(&mut self, user_id: UserId) -> StoreResult<Decimal> {
        Ok(self
            .working
            .withdrawals
            .values()
            .filter(|w| w.user_id == user_id && w.status == WithdrawalStatus::Pending)
            .map(|w| w.amount)
            .sum())
    }

    async fn settle_withdrawal(&mut self, request: &WithdrawalRequest) -> StoreResult<bool> {
        match self.working.withdrawals.get_mut(&request.id) {
            Some(stored) if stored.is_pending() => {
                stored.status = request.status;
                stored.tx_hash = request.tx_hash.clone();
                stored.failure_reason = request.failure_reason.clone();
                stored.processed_at = request.processed_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_bonus(&mut self, bonus: &ReferralBonus) -> StoreResult<()> {
        if self.working.bonuses.contains_key(&bonus.id) {
            return Err(StoreError::Conflict(format!("referral bonus {} exists", bonus.id)));
        }
        self.working.bonuses.insert(bonus.id, bonus.clone());
        Ok(())
    }

    async fn list_bonuses_of(&mut self, beneficiary: UserId) -> StoreResult<Vec<ReferralBonus>> {
        Ok(self
            .working
            .bonuses
            .values()
            .filter(|b| b.beneficiary_user_id == beneficiary)
            .cloned()
            .collect())
    }

    async fn due_bonus_users(&mut self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<UserId>> {
        let users: BTreeSet<UserId> = self
            .working
            .bonuses
            .values()
            .filter(|b| b.is_due(now))
            .map(|b| b.beneficiary_user_id)
            .collect();
        Ok(users.into_iter().take(limit).collect())
    }

    async fn unlock_due_bonuses(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(ReferralBonusId, Decimal)>> {
        let mut flipped = Vec::new();
        for bonus in self.working.bonuses.values_mut() {
            if bonus.beneficiary_user_id == user_id && bonus.is_due(now) {
                bonus.unlock().map_err(|e| StoreError::Corrupt(e.to_string()))?;
                flipped.push((bonus.id, bonus.amount));
            }
        }
        Ok(flipped)
    }

    async fn commit(self) -> StoreResult<()> {
        let InMemoryTx {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}
