//! Enqueues the settlement job kinds with their retry policies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use vaultledger_core::{GrowthJobId, WithdrawalId};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobKind, RetryPolicy};

#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn schedule_growth(
        &self,
        growth_job_id: GrowthJobId,
        now: DateTime<Utc>,
        run_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Result<JobId, JobStoreError> {
        self.schedule(JobKind::DistributeGrowth { growth_job_id }, now, run_at, policy)
    }

    pub fn schedule_payout(
        &self,
        withdrawal_id: WithdrawalId,
        now: DateTime<Utc>,
        run_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Result<JobId, JobStoreError> {
        self.schedule(JobKind::Payout { withdrawal_id }, now, run_at, policy)
    }

    pub fn schedule_unlock(&self, now: DateTime<Utc>, run_at: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        self.schedule(JobKind::UnlockBonuses, now, run_at, RetryPolicy::no_retry())
    }

    fn schedule(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        run_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Result<JobId, JobStoreError> {
        let job = Job::new(kind, now).with_retry_policy(policy).scheduled_at(run_at);
        debug!(job_id = %job.id, kind = job.kind.type_name(), %run_at, "job scheduled");
        self.store.enqueue(job)
    }
}
