//! Job handlers wiring the settlement engines into the job executor.

use tracing::{error, warn};

use crate::growth::GrowthEngine;
use crate::jobs::{Job, JobExecutor, JobKind, JobResult};
use crate::payout::{PayoutOutcome, PayoutService};
use crate::store::SettlementStore;
use crate::unlock::UnlockEngine;

/// Register handlers for every settlement job kind.
///
/// A payout whose attempts run out is dead-lettered and its withdrawal stays
/// pending with the balance still reserved, since the chain may have paid.
/// Only an operator marks it failed.
pub fn register_settlement_handlers<S>(
    executor: &mut JobExecutor,
    growth: GrowthEngine<S>,
    unlock: UnlockEngine<S>,
    payouts: PayoutService<S>,
) where
    S: SettlementStore + Clone + 'static,
{
    executor.register_handler(JobKind::DISTRIBUTE_GROWTH, move |job: Job| {
        let growth = growth.clone();
        async move {
            let JobKind::DistributeGrowth { growth_job_id } = &job.kind else {
                return mismatched(&job);
            };
            match growth.run_growth_job(*growth_job_id).await {
                Ok(_) => JobResult::Success,
                Err(e) => JobResult::Failure(e.to_string()),
            }
        }
    });

    executor.register_handler(JobKind::UNLOCK_BONUSES, move |_job: Job| {
        let unlock = unlock.clone();
        async move {
            match unlock.run_unlock_pass().await {
                Ok(_) => JobResult::Success,
                Err(e) => JobResult::Failure(e.to_string()),
            }
        }
    });

    executor.register_handler(JobKind::PAYOUT, move |job: Job| {
        let payouts = payouts.clone();
        async move {
            let &JobKind::Payout { withdrawal_id } = &job.kind else {
                return mismatched(&job);
            };
            match payouts.run_payout_job(withdrawal_id).await {
                Ok(PayoutOutcome::Processed { .. } | PayoutOutcome::Skipped) => JobResult::Success,
                Ok(PayoutOutcome::Unsettled { tx_hash }) => {
                    warn!(%withdrawal_id, ?tx_hash, "payout left unsettled");
                    JobResult::Success
                }
                Err(e) => {
                    if !job.retry_policy.should_retry(job.attempt) {
                        error!(
                            %withdrawal_id,
                            error = %e,
                            attempts = job.attempt,
                            "payout attempts exhausted, withdrawal left pending for review"
                        );
                    }
                    JobResult::Failure(e.to_string())
                }
            }
        }
    });
}

fn mismatched(job: &Job) -> JobResult {
    JobResult::Failure(format!("handler received job kind {}", job.kind.type_name()))
}
