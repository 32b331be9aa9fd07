//! Postgres-backed settlement store.
//!
//! Each `PgTx` wraps one database transaction. Conditional writes are plain
//! `UPDATE ... WHERE <predicate>` statements and report whether a row matched.
//! Under READ COMMITTED a conditional update that loses a race matches zero
//! rows and the next read in the same transaction sees the winner's commit,
//! which is what the purse CAS loop relies on.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate growth job, earning, purse or ledger sequence |
//! | Database (foreign key violation) | `23503` | `NotFound` | Referenced user/basket/purse missing |
//! | Database (other) | Any other | `Storage` | Check constraints, syntax, etc. |
//! | RowNotFound | N/A | `NotFound` | Should not occur (we use `fetch_optional`) |
//! | Other | N/A | `Storage` | Network errors, pool closed, etc. |

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use vaultledger_core::{
    AggregateRoot, BasketId, EntryId, GrowthEarningId, GrowthJobId, InvestmentId, PurseId,
    ReferralBonusId, UserId, WithdrawalId,
};
use vaultledger_investments::{
    Basket, GrowthEarning, GrowthJob, GrowthWindow, Investment, InvestmentStatus,
};
use vaultledger_ledger::{Direction, EntryContext, LedgerEntry, Purse, PurseKind};
use vaultledger_referrals::{ReferralBonus, ReferralBonusKind, UplineLabel, UplinePath, UserAccount};
use vaultledger_withdrawals::{PayoutAddress, WithdrawalRequest, WithdrawalStatus};

use super::{PurseKey, SettlementStore, StoreTx};
use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = include_str!("../../migrations/0001_settlement.sql");

#[derive(Debug, Clone)]
pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create missing tables and indexes.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("init_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl SettlementStore for PgSettlementStore {
    type Tx = PgTx;

    async fn begin(&self) -> StoreResult<PgTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgTx { tx })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StoreTx for PgTx {
    async fn find_purse(&mut self, key: PurseKey) -> StoreResult<Option<Purse>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, kind, amount, version
            FROM purses
            WHERE user_id = $1 AND kind = $2
            "#,
        )
        .bind(key.user_id.as_uuid())
        .bind(key.kind.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_purse", e))?;

        row.map(|r| purse_from_row(&r)).transpose()
    }

    #[instrument(skip_all, fields(user_id = %purse.user_id(), kind = %purse.kind()), err)]
    async fn insert_purse(&mut self, purse: &Purse) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO purses (id, user_id, kind, amount, version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(purse.id_typed().as_uuid())
        .bind(purse.user_id().as_uuid())
        .bind(purse.kind().as_str())
        .bind(purse.amount())
        .bind(purse.version() as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_purse", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(purse_id = %purse_id), err)]
    async fn update_purse_if_version(
        &mut self,
        purse_id: PurseId,
        expected_version: u64,
        amount: Decimal,
        version: u64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE purses
            SET amount = $3, version = $4
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(purse_id.as_uuid())
        .bind(expected_version as i64)
        .bind(amount)
        .bind(version as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_purse_if_version", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, purse_id, direction, context, amount, balance_after,
                sequence, related_entity_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.purse_id.as_uuid())
        .bind(entry.direction.as_str())
        .bind(entry.context.as_str())
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(entry.sequence as i64)
        .bind(entry.related_entity_id)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_entry", e))?;
        Ok(())
    }

    async fn list_entries(&mut self, purse_id: PurseId) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, purse_id, direction, context, amount, balance_after,
                   sequence, related_entity_id, created_at
            FROM ledger_entries
            WHERE purse_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(purse_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_user(&mut self, user: &UserAccount) -> StoreResult<()> {
        let upline: Vec<String> = user
            .upline
            .ancestors()
            .iter()
            .map(|l| l.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO users (id, upline_label, upline, joined_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(user.upline_label.as_str())
        .bind(upline)
        .bind(user.joined_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;
        Ok(())
    }

    async fn find_user(&mut self, user_id: UserId) -> StoreResult<Option<UserAccount>> {
        let row = sqlx::query(
            "SELECT id, upline_label, upline, joined_at FROM users WHERE id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_user", e))?;

        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn find_user_by_label(&mut self, label: &UplineLabel) -> StoreResult<Option<UserAccount>> {
        let row = sqlx::query(
            "SELECT id, upline_label, upline, joined_at FROM users WHERE upline_label = $1",
        )
        .bind(label.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_user_by_label", e))?;

        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn count_descendants_at(&mut self, label: &UplineLabel, level: usize) -> StoreResult<u64> {
        if level == 0 {
            return Ok(0);
        }
        // Postgres arrays are 1-based, so upline[level] is the ancestor
        // `level` steps up.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE upline[$2] = $1")
            .bind(label.as_str())
            .bind(level as i32)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_descendants_at", e))?;
        Ok(count as u64)
    }

    async fn insert_basket(&mut self, basket: &Basket) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO baskets (id, tier, min_amount, max_amount)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(basket.id.as_uuid())
        .bind(i16::from(basket.tier))
        .bind(basket.min_amount)
        .bind(basket.max_amount)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_basket", e))?;
        Ok(())
    }

    async fn find_basket(&mut self, basket_id: BasketId) -> StoreResult<Option<Basket>> {
        let row = sqlx::query("SELECT id, tier, min_amount, max_amount FROM baskets WHERE id = $1")
            .bind(basket_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_basket", e))?;

        row.map(|r| basket_from_row(&r)).transpose()
    }

    async fn list_baskets(&mut self) -> StoreResult<Vec<Basket>> {
        let rows = sqlx::query("SELECT id, tier, min_amount, max_amount FROM baskets ORDER BY tier")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_baskets", e))?;

        rows.iter().map(basket_from_row).collect()
    }

    async fn insert_investment(&mut self, investment: &Investment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO investments (
                id, user_id, basket_id, initial_amount, amount, tenure_months,
                status, started_at, closed_at, switched_to
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(investment.id.as_uuid())
        .bind(investment.user_id.as_uuid())
        .bind(investment.basket_id.as_uuid())
        .bind(investment.initial_amount)
        .bind(investment.amount)
        .bind(investment.tenure_months as i32)
        .bind(investment.status.as_str())
        .bind(investment.started_at)
        .bind(investment.closed_at)
        .bind(investment.switched_to.map(Uuid::from))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_investment", e))?;
        Ok(())
    }

    async fn find_investment(&mut self, investment_id: InvestmentId) -> StoreResult<Option<Investment>> {
        let row = sqlx::query(&format!("{INVESTMENT_COLUMNS} WHERE id = $1"))
            .bind(investment_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_investment", e))?;

        row.map(|r| investment_from_row(&r)).transpose()
    }

    async fn save_investment_status(&mut self, investment: &Investment) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE investments
            SET status = $2, closed_at = $3, switched_to = $4
            WHERE id = $1
            "#,
        )
        .bind(investment.id.as_uuid())
        .bind(investment.status.as_str())
        .bind(investment.closed_at)
        .bind(investment.switched_to.map(Uuid::from))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_investment_status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("investment {}", investment.id)));
        }
        Ok(())
    }

    async fn update_investment_amount(
        &mut self,
        investment_id: InvestmentId,
        expected: Decimal,
        amount: Decimal,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE investments SET amount = $3 WHERE id = $1 AND amount = $2")
            .bind(investment_id.as_uuid())
            .bind(expected)
            .bind(amount)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_investment_amount", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_investments(&mut self, user_id: UserId) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM investments WHERE user_id = $1 AND status <> 'switched')",
        )
        .bind(user_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("has_investments", e))?;
        Ok(exists)
    }

    #[instrument(skip(self, window), fields(basket_id = %basket_id), err)]
    async fn count_growth_population(
        &mut self,
        basket_id: BasketId,
        window: &GrowthWindow,
    ) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM investments WHERE {POPULATION_PREDICATE}"
        ))
        .bind(basket_id.as_uuid())
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("count_growth_population", e))?;
        Ok(count as u64)
    }

    #[instrument(skip(self, window), fields(basket_id = %basket_id), err)]
    async fn growth_population_page(
        &mut self,
        basket_id: BasketId,
        window: &GrowthWindow,
        offset: u64,
        limit: usize,
    ) -> StoreResult<Vec<Investment>> {
        let rows = sqlx::query(&format!(
            "{INVESTMENT_COLUMNS} WHERE {POPULATION_PREDICATE} ORDER BY id ASC OFFSET $4 LIMIT $5"
        ))
        .bind(basket_id.as_uuid())
        .bind(window.start)
        .bind(window.end)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("growth_population_page", e))?;

        rows.iter().map(investment_from_row).collect()
    }

    #[instrument(skip_all, fields(growth_job_id = %job.id, basket_id = %job.basket_id), err)]
    async fn insert_growth_job(&mut self, job: &GrowthJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO growth_jobs (
                id, basket_id, month, year, growth_percent, affected, processed, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.basket_id.as_uuid())
        .bind(job.month as i16)
        .bind(job.year)
        .bind(job.growth_percent)
        .bind(job.affected as i64)
        .bind(job.processed as i64)
        .bind(job.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_growth_job", e))?;
        Ok(())
    }

    async fn find_growth_job(&mut self, job_id: GrowthJobId) -> StoreResult<Option<GrowthJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, basket_id, month, year, growth_percent, affected, processed, created_at
            FROM growth_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_growth_job", e))?;

        row.map(|r| growth_job_from_row(&r)).transpose()
    }

    async fn growth_job_exists(&mut self, basket_id: BasketId, month: u32, year: i32) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM growth_jobs WHERE basket_id = $1 AND month = $2 AND year = $3)",
        )
        .bind(basket_id.as_uuid())
        .bind(month as i16)
        .bind(year)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("growth_job_exists", e))?;
        Ok(exists)
    }

    async fn list_incomplete_growth_jobs(&mut self) -> StoreResult<Vec<GrowthJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, basket_id, month, year, growth_percent, affected, processed, created_at
            FROM growth_jobs
            WHERE processed < affected
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_incomplete_growth_jobs", e))?;

        rows.iter().map(growth_job_from_row).collect()
    }

    #[instrument(skip(self), fields(growth_job_id = %job_id), err)]
    async fn advance_growth_job(
        &mut self,
        job_id: GrowthJobId,
        expected_processed: u64,
        processed: u64,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE growth_jobs SET processed = $3 WHERE id = $1 AND processed = $2")
            .bind(job_id.as_uuid())
            .bind(expected_processed as i64)
            .bind(processed as i64)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("advance_growth_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_growth_earning(&mut self, earning: &GrowthEarning) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO growth_earnings (
                id, growth_job_id, investment_id, user_id, amount_before, earning, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(earning.id.as_uuid())
        .bind(earning.growth_job_id.as_uuid())
        .bind(earning.investment_id.as_uuid())
        .bind(earning.user_id.as_uuid())
        .bind(earning.amount_before)
        .bind(earning.earning)
        .bind(earning.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_growth_earning", e))?;
        Ok(())
    }

    async fn list_growth_earnings(&mut self, job_id: GrowthJobId) -> StoreResult<Vec<GrowthEarning>> {
        let rows = sqlx::query(
            r#"
            SELECT id, growth_job_id, investment_id, user_id, amount_before, earning, created_at
            FROM growth_earnings
            WHERE growth_job_id = $1
            ORDER BY investment_id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_growth_earnings", e))?;

        rows.iter().map(earning_from_row).collect()
    }

    async fn insert_withdrawal(&mut self, request: &WithdrawalRequest) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO withdrawals (
                id, user_id, address, amount, status, scheduled_at,
                tx_hash, failure_reason, processed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.user_id.as_uuid())
        .bind(request.address.as_str())
        .bind(request.amount)
        .bind(request.status.as_str())
        .bind(request.scheduled_at)
        .bind(request.tx_hash.as_deref())
        .bind(request.failure_reason.as_deref())
        .bind(request.processed_at)
        .bind(request.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_withdrawal", e))?;
        Ok(())
    }

    async fn find_withdrawal(&mut self, withdrawal_id: WithdrawalId) -> StoreResult<Option<WithdrawalRequest>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, address, amount, status, scheduled_at,
                   tx_hash, failure_reason, processed_at, created_at
            FROM withdrawals
            WHERE id = $1
            "#,
        )
        .bind(withdrawal_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_withdrawal", e))?;

        row.map(|r| withdrawal_from_row(&r)).transpose()
    }

    async fn list_pending_withdrawals(&mut self) -> StoreResult<Vec<WithdrawalRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, address, amount, status, scheduled_at,
                   tx_hash, failure_reason, processed_at, created_at
            FROM withdrawals
            WHERE status = 'pending'
            ORDER BY scheduled_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_pending_withdrawals", e))?;

        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn pending_withdrawal_total(&mut self, user_id: UserId) -> StoreResult<Decimal> {
        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(amount) FROM withdrawals WHERE user_id = $1 AND status = 'pending'",
        )
        .bind(user_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("pending_withdrawal_total", e))?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    #[instrument(skip_all, fields(withdrawal_id = %request.id, status = request.status.as_str()), err)]
    async fn settle_withdrawal(&mut self, request: &WithdrawalRequest) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE withdrawals
            SET status = $2, tx_hash = $3, failure_reason = $4, processed_at = $5
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.status.as_str())
        .bind(request.tx_hash.as_deref())
        .bind(request.failure_reason.as_deref())
        .bind(request.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("settle_withdrawal", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_bonus(&mut self, bonus: &ReferralBonus) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO referral_bonuses (
                id, kind, beneficiary_user_id, referred_user_id, source_entity_id,
                amount, percent, level, unlocked, unlock_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(bonus.id.as_uuid())
        .bind(bonus.kind.as_str())
        .bind(bonus.beneficiary_user_id.as_uuid())
        .bind(bonus.referred_user_id.as_uuid())
        .bind(bonus.source_entity_id)
        .bind(bonus.amount)
        .bind(bonus.percent)
        .bind(bonus.level as i32)
        .bind(bonus.unlocked)
        .bind(bonus.unlock_at)
        .bind(bonus.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_bonus", e))?;
        Ok(())
    }

    async fn list_bonuses_of(&mut self, beneficiary: UserId) -> StoreResult<Vec<ReferralBonus>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, beneficiary_user_id, referred_user_id, source_entity_id,
                   amount, percent, level, unlocked, unlock_at, created_at
            FROM referral_bonuses
            WHERE beneficiary_user_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(beneficiary.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_bonuses_of", e))?;

        rows.iter().map(bonus_from_row).collect()
    }

    async fn due_bonus_users(&mut self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<UserId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT beneficiary_user_id
            FROM referral_bonuses
            WHERE NOT unlocked AND unlock_at <= $1
            ORDER BY beneficiary_user_id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("due_bonus_users", e))?;
        Ok(ids.into_iter().map(UserId::from_uuid).collect())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn unlock_due_bonuses(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(ReferralBonusId, Decimal)>> {
        let rows = sqlx::query(
            r#"
            UPDATE referral_bonuses
            SET unlocked = TRUE
            WHERE beneficiary_user_id = $1 AND NOT unlocked AND unlock_at <= $2
            RETURNING id, amount
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("unlock_due_bonuses", e))?;

        rows.iter()
            .map(|r| {
                Ok((
                    ReferralBonusId::from_uuid(column(r, "id")?),
                    column(r, "amount")?,
                ))
            })
            .collect()
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

const INVESTMENT_COLUMNS: &str = r#"
    SELECT id, user_id, basket_id, initial_amount, amount, tenure_months,
           status, started_at, closed_at, switched_to
    FROM investments
"#;

/// Binds: $1 basket, $2 window start, $3 window end.
const POPULATION_PREDICATE: &str = r#"
    basket_id = $1
    AND started_at <= $3
    AND (status = 'active' OR (closed_at >= $2 AND closed_at <= $3))
"#;

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("failed to read {name}: {e}")))
}

fn corrupt(what: &str, value: impl core::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("unknown {what}: {value}"))
}

fn purse_from_row(row: &PgRow) -> StoreResult<Purse> {
    let kind: String = column(row, "kind")?;
    let version: i64 = column(row, "version")?;
    Purse::from_parts(
        PurseId::from_uuid(column(row, "id")?),
        UserId::from_uuid(column(row, "user_id")?),
        PurseKind::parse(&kind).ok_or_else(|| corrupt("purse kind", &kind))?,
        column(row, "amount")?,
        version as u64,
    )
    .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn entry_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    let direction: String = column(row, "direction")?;
    let context: String = column(row, "context")?;
    let sequence: i64 = column(row, "sequence")?;
    Ok(LedgerEntry {
        id: EntryId::from_uuid(column(row, "id")?),
        purse_id: PurseId::from_uuid(column(row, "purse_id")?),
        direction: Direction::parse(&direction).ok_or_else(|| corrupt("direction", &direction))?,
        context: EntryContext::parse(&context).ok_or_else(|| corrupt("entry context", &context))?,
        amount: column(row, "amount")?,
        balance_after: column(row, "balance_after")?,
        sequence: sequence as u64,
        related_entity_id: column(row, "related_entity_id")?,
        created_at: column(row, "created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> StoreResult<UserAccount> {
    let label: String = column(row, "upline_label")?;
    let upline: Vec<String> = column(row, "upline")?;
    let to_corrupt = |e: vaultledger_core::DomainError| StoreError::Corrupt(e.to_string());
    let labels = upline
        .iter()
        .map(|l| UplineLabel::parse(l))
        .collect::<Result<Vec<_>, _>>()
        .map_err(to_corrupt)?;
    Ok(UserAccount {
        id: UserId::from_uuid(column(row, "id")?),
        upline_label: UplineLabel::parse(&label).map_err(to_corrupt)?,
        upline: UplinePath::from_labels(labels),
        joined_at: column(row, "joined_at")?,
    })
}

fn basket_from_row(row: &PgRow) -> StoreResult<Basket> {
    let tier: i16 = column(row, "tier")?;
    Ok(Basket {
        id: BasketId::from_uuid(column(row, "id")?),
        tier: u8::try_from(tier).map_err(|_| corrupt("basket tier", tier))?,
        min_amount: column(row, "min_amount")?,
        max_amount: column(row, "max_amount")?,
    })
}

fn investment_from_row(row: &PgRow) -> StoreResult<Investment> {
    let status: String = column(row, "status")?;
    let tenure: i32 = column(row, "tenure_months")?;
    let switched_to: Option<Uuid> = column(row, "switched_to")?;
    Ok(Investment {
        id: InvestmentId::from_uuid(column(row, "id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        basket_id: BasketId::from_uuid(column(row, "basket_id")?),
        initial_amount: column(row, "initial_amount")?,
        amount: column(row, "amount")?,
        tenure_months: u32::try_from(tenure).map_err(|_| corrupt("tenure", tenure))?,
        status: InvestmentStatus::parse(&status)
            .ok_or_else(|| corrupt("investment status", &status))?,
        started_at: column(row, "started_at")?,
        closed_at: column(row, "closed_at")?,
        switched_to: switched_to.map(InvestmentId::from_uuid),
    })
}

fn growth_job_from_row(row: &PgRow) -> StoreResult<GrowthJob> {
    let month: i16 = column(row, "month")?;
    let affected: i64 = column(row, "affected")?;
    let processed: i64 = column(row, "processed")?;
    Ok(GrowthJob {
        id: GrowthJobId::from_uuid(column(row, "id")?),
        basket_id: BasketId::from_uuid(column(row, "basket_id")?),
        month: u32::try_from(month).map_err(|_| corrupt("month", month))?,
        year: column(row, "year")?,
        growth_percent: column(row, "growth_percent")?,
        affected: affected as u64,
        processed: processed as u64,
        created_at: column(row, "created_at")?,
    })
}

fn earning_from_row(row: &PgRow) -> StoreResult<GrowthEarning> {
    Ok(GrowthEarning {
        id: GrowthEarningId::from_uuid(column(row, "id")?),
        growth_job_id: GrowthJobId::from_uuid(column(row, "growth_job_id")?),
        investment_id: InvestmentId::from_uuid(column(row, "investment_id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        amount_before: column(row, "amount_before")?,
        earning: column(row, "earning")?,
        created_at: column(row, "created_at")?,
    })
}

fn withdrawal_from_row(row: &PgRow) -> StoreResult<WithdrawalRequest> {
    let status: String = column(row, "status")?;
    let address: String = column(row, "address")?;
    Ok(WithdrawalRequest {
        id: WithdrawalId::from_uuid(column(row, "id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        address: PayoutAddress::parse(&address).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        amount: column(row, "amount")?,
        status: WithdrawalStatus::parse(&status)
            .ok_or_else(|| corrupt("withdrawal status", &status))?,
        scheduled_at: column(row, "scheduled_at")?,
        tx_hash: column(row, "tx_hash")?,
        failure_reason: column(row, "failure_reason")?,
        processed_at: column(row, "processed_at")?,
        created_at: column(row, "created_at")?,
    })
}

fn bonus_from_row(row: &PgRow) -> StoreResult<ReferralBonus> {
    let kind: String = column(row, "kind")?;
    let level: i32 = column(row, "level")?;
    Ok(ReferralBonus {
        id: ReferralBonusId::from_uuid(column(row, "id")?),
        kind: ReferralBonusKind::parse(&kind).ok_or_else(|| corrupt("bonus kind", &kind))?,
        beneficiary_user_id: UserId::from_uuid(column(row, "beneficiary_user_id")?),
        referred_user_id: UserId::from_uuid(column(row, "referred_user_id")?),
        source_entity_id: column(row, "source_entity_id")?,
        amount: column(row, "amount")?,
        percent: column(row, "percent")?,
        level: u32::try_from(level).map_err(|_| corrupt("bonus level", level))?,
        unlocked: column(row, "unlocked")?,
        unlock_at: column(row, "unlock_at")?,
        created_at: column(row, "created_at")?,
    })
}
