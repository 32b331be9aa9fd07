//! Growth distribution engine.
//!
//! A growth job distributes one basket's monthly growth percent over every
//! investment in the basket's population for that month. Work is committed a
//! page at a time; each page's earnings, investment amounts, Trade purse
//! entries and the job's `processed` cursor commit together, so a crashed run
//! resumes at the last committed page and never pays a page twice.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, instrument};
use uuid::Uuid;

use vaultledger_core::{BasketId, DomainError, GrowthEarningId, GrowthJobId};
use vaultledger_investments::{
    GrowthEarning, GrowthJob, GrowthWindow, Investment, compute_earning, ensure_past_month,
};
use vaultledger_ledger::EntryContext;

use crate::clock::{Clock, after};
use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult, StoreError};
use crate::jobs::JobScheduler;
use crate::ledger_store::PurseLedger;
use crate::store::{PurseKey, SettlementStore, StoreTx};

/// Outcome of one page step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthStep {
    /// Nothing left to do; re-running a finished job lands here.
    AlreadyComplete,
    Advanced { processed: u64, affected: u64 },
    Completed { processed: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthRunReport {
    pub pages: u32,
    pub processed: u64,
    pub affected: u64,
}

pub struct GrowthEngine<S> {
    store: S,
    ledger: PurseLedger,
    scheduler: JobScheduler,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl<S: Clone> Clone for GrowthEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: SettlementStore> GrowthEngine<S> {
    pub fn new(
        store: S,
        ledger: PurseLedger,
        scheduler: JobScheduler,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            scheduler,
            clock,
            config,
        }
    }

    fn window(&self, month: u32, year: i32) -> SettlementResult<GrowthWindow> {
        Ok(GrowthWindow::for_month(month, year, self.config.growth.start_day)?)
    }

    /// Declare one month's growth for every basket.
    ///
    /// `growth` must name each known basket exactly once. All jobs are created
    /// in one transaction with `affected` fixed from the current population,
    /// then one delayed distribution job is scheduled per growth job.
    #[instrument(skip(self, growth), fields(baskets = growth.len()), err)]
    pub async fn create_growth_jobs(
        &self,
        month: u32,
        year: i32,
        growth: &[(BasketId, Decimal)],
    ) -> SettlementResult<Vec<GrowthJob>> {
        let now = self.clock.now();
        ensure_past_month(month, year, now)?;
        let window = self.window(month, year)?;

        let mut tx = self.store.begin().await?;

        let known: BTreeSet<BasketId> = tx.list_baskets().await?.iter().map(|b| b.id).collect();
        let requested: BTreeSet<BasketId> = growth.iter().map(|(id, _)| *id).collect();
        if requested.len() != growth.len() || requested != known {
            return Err(DomainError::validation(
                "growth must be declared for every basket exactly once",
            )
            .into());
        }

        let mut jobs = Vec::with_capacity(growth.len());
        for (basket_id, percent) in growth {
            if tx.growth_job_exists(*basket_id, month, year).await? {
                return Err(DomainError::conflict(format!(
                    "growth for basket {basket_id} in {year}-{month:02} already exists"
                ))
                .into());
            }
            let affected = tx.count_growth_population(*basket_id, &window).await?;
            let job = GrowthJob::new(*basket_id, month, year, *percent, affected, now);
            tx.insert_growth_job(&job).await?;
            jobs.push(job);
        }

        tx.commit().await?;

        let run_at = after(now, self.config.growth.schedule_delay);
        for job in &jobs {
            self.scheduler
                .schedule_growth(job.id, now, run_at, self.config.growth_retry_policy())?;
            info!(
                growth_job_id = %job.id,
                basket_id = %job.basket_id,
                affected = job.affected,
                %run_at,
                "growth job created"
            );
        }
        Ok(jobs)
    }

    /// Re-enqueue a distribution job for every incomplete growth job, ready
    /// now. Used on startup; each run resumes at the committed cursor.
    #[instrument(skip(self), err)]
    pub async fn resume_incomplete_jobs(&self) -> SettlementResult<usize> {
        let incomplete = {
            let mut tx = self.store.begin().await?;
            tx.list_incomplete_growth_jobs().await?
        };
        let now = self.clock.now();
        for job in &incomplete {
            self.scheduler
                .schedule_growth(job.id, now, now, self.config.growth_retry_policy())?;
            info!(
                growth_job_id = %job.id,
                processed = job.processed,
                affected = job.affected,
                "growth job re-enqueued"
            );
        }
        Ok(incomplete.len())
    }

    /// Process one page of a growth job.
    #[instrument(skip(self), fields(growth_job_id = %job_id), err)]
    pub async fn advance_growth_job(&self, job_id: GrowthJobId) -> SettlementResult<GrowthStep> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let job = tx
            .find_growth_job(job_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("growth job {job_id}")))?;
        if job.is_complete() {
            return Ok(GrowthStep::AlreadyComplete);
        }

        let window = self.window(job.month, job.year)?;
        let actual = tx.count_growth_population(job.basket_id, &window).await?;
        if actual != job.affected {
            error!(
                growth_job_id = %job.id,
                expected = job.affected,
                actual,
                "growth population drifted, job left for operator review"
            );
            return Err(SettlementError::PopulationDrift {
                job: job.id,
                expected: job.affected,
                actual,
            });
        }

        let growth_per_day = window.growth_per_day(job.growth_percent)?;
        let page = tx
            .growth_population_page(job.basket_id, &window, job.processed, self.config.growth.page_size)
            .await?;
        if page.is_empty() {
            return Err(DomainError::invariant(format!(
                "growth job {} has {} of {} processed but no remaining population",
                job.id, job.processed, job.affected
            ))
            .into());
        }

        for investment in &page {
            let days_held = window.days_held(investment);
            let earning = compute_earning(investment.amount, growth_per_day, days_held);
            self.apply_earning(&mut tx, &job, investment, earning, now).await?;
        }

        let processed = job.next_processed(page.len())?;
        if !tx.advance_growth_job(job.id, job.processed, processed).await? {
            return Err(StoreError::Conflict(format!(
                "growth job {} cursor moved past {}",
                job.id, job.processed
            ))
            .into());
        }
        tx.commit().await?;

        info!(
            growth_job_id = %job.id,
            page_len = page.len(),
            processed,
            affected = job.affected,
            "growth page committed"
        );

        if processed == job.affected {
            Ok(GrowthStep::Completed { processed })
        } else {
            Ok(GrowthStep::Advanced {
                processed,
                affected: job.affected,
            })
        }
    }

    /// Step a growth job until it is complete.
    pub async fn run_growth_job(&self, job_id: GrowthJobId) -> SettlementResult<GrowthRunReport> {
        let mut pages = 0;
        loop {
            match self.advance_growth_job(job_id).await? {
                GrowthStep::Advanced { .. } => pages += 1,
                GrowthStep::Completed { .. } => {
                    pages += 1;
                    break;
                }
                GrowthStep::AlreadyComplete => break,
            }
        }

        let mut tx = self.store.begin().await?;
        let job = tx
            .find_growth_job(job_id)
            .await?
            .ok_or_else(|| SettlementError::not_found(format!("growth job {job_id}")))?;
        Ok(GrowthRunReport {
            pages,
            processed: job.processed,
            affected: job.affected,
        })
    }

    async fn apply_earning(
        &self,
        tx: &mut S::Tx,
        job: &GrowthJob,
        investment: &Investment,
        earning: Decimal,
        now: DateTime<Utc>,
    ) -> SettlementResult<()> {
        let amount = investment.amount_after(earning)?;
        let record = GrowthEarning {
            id: GrowthEarningId::new(),
            growth_job_id: job.id,
            investment_id: investment.id,
            user_id: investment.user_id,
            amount_before: investment.amount,
            earning,
            created_at: now,
        };
        tx.insert_growth_earning(&record).await?;

        if !tx
            .update_investment_amount(investment.id, investment.amount, amount)
            .await?
        {
            return Err(StoreError::Conflict(format!(
                "investment {} amount changed during growth",
                investment.id
            ))
            .into());
        }

        let trade = PurseKey::trade(investment.user_id);
        let related = Some(Uuid::from(record.id));
        if earning > Decimal::ZERO {
            self.ledger
                .credit(tx, trade, earning, EntryContext::InvestmentEarning, related, now)
                .await?;
        } else if earning < Decimal::ZERO {
            self.ledger
                .debit(tx, trade, -earning, EntryContext::InvestmentEarning, related, now)
                .await?;
        }
        Ok(())
    }
}
