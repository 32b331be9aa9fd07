//! Settlement worker: runs the job executor and the periodic unlock pass.

mod config;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use vaultledger_infra::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig, JobScheduler, JobStore};
use vaultledger_infra::{
    Clock, DryRunChainClient, GrowthEngine, InMemorySettlementStore, PayoutSerializer, PayoutService,
    PgSettlementStore, PurseLedger, SettlementConfig, SettlementStore, SystemClock, UnlockEngine,
    register_settlement_handlers,
};

use crate::config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    vaultledger_observability::tracing::init(args.log_format, "info");

    if let Err(e) = args.validate() {
        error!("configuration error: {e}");
        std::process::exit(1);
    }
    let config = args.settlement_config();

    match &args.database_url {
        Some(url) => {
            let store = PgSettlementStore::connect(url, args.max_connections).await?;
            if args.init_schema {
                store.init_schema().await?;
                info!("schema applied");
            }
            info!(max_connections = args.max_connections, "using postgres store");
            run(store, &args, config).await
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            run(InMemorySettlementStore::new(), &args, config).await
        }
    }
}

async fn run<S>(store: S, args: &Args, config: SettlementConfig) -> anyhow::Result<()>
where
    S: SettlementStore + Clone + 'static,
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = InMemoryJobStore::arc();
    let scheduler = JobScheduler::new(jobs.clone());
    let ledger = PurseLedger::new();

    warn!("no chain client configured; payouts run in dry-run mode");
    let (serializer, serializer_task) = PayoutSerializer::spawn();

    let growth = GrowthEngine::new(
        store.clone(),
        ledger.clone(),
        scheduler.clone(),
        clock.clone(),
        config.clone(),
    );
    let unlock = UnlockEngine::new(store.clone(), ledger.clone(), clock.clone(), config.clone());
    let payouts = PayoutService::new(
        store,
        ledger,
        Arc::new(DryRunChainClient),
        serializer,
        scheduler.clone(),
        clock.clone(),
        config,
    );

    // Jobs live in memory; rebuild them from the durable settlement state.
    let growth_jobs = growth.resume_incomplete_jobs().await?;
    let payout_jobs = payouts.resume_pending_payouts().await?;
    info!(growth_jobs, payout_jobs, "outstanding work re-enqueued");

    let mut executor = JobExecutor::new(jobs.clone(), clock.clone());
    register_settlement_handlers(&mut executor, growth, unlock, payouts);
    let handle = executor.spawn(
        JobExecutorConfig::default()
            .with_name("settlement")
            .with_poll_interval(args.poll_interval()),
    );

    let mut unlock_ticks = tokio::time::interval(args.unlock_interval());
    info!(unlock_interval = ?args.unlock_interval(), "settlement worker running");

    loop {
        tokio::select! {
            _ = unlock_ticks.tick() => {
                let now = clock.now();
                if let Err(e) = scheduler.schedule_unlock(now, now) {
                    error!(error = %e, "failed to schedule unlock pass");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    info!("shutting down");
    let stats = handle.stats();
    handle.shutdown().await;
    serializer_task.abort();
    report_dead_letters(&*jobs);
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        dead_lettered = stats.jobs_dead_lettered,
        "settlement worker stopped"
    );
    Ok(())
}

/// Log every dead-lettered job so an operator can act on it before the
/// in-memory queue is gone.
fn report_dead_letters(jobs: &dyn JobStore) {
    match jobs.list_dead_letters(usize::MAX) {
        Ok(entries) => {
            for entry in entries {
                warn!(
                    job_id = %entry.job.id,
                    kind = ?entry.job.kind,
                    attempts = entry.job.attempt,
                    reason = %entry.reason,
                    at = %entry.dead_lettered_at,
                    "dead-lettered job needs review"
                );
            }
        }
        Err(e) => error!(error = %e, "failed to list dead-lettered jobs"),
    }
    if let Ok(stats) = jobs.stats() {
        info!(
            pending = stats.pending,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "job queue at shutdown"
        );
    }
}
