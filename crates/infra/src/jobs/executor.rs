//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobResult, JobStatus};
use crate::clock::Clock;

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

/// Job handler function type. Handlers receive an owned snapshot of the job.
pub type JobHandler = Arc<dyn Fn(Job) -> JobFuture + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long to wait when no job is ready
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop after the job in flight, if any, and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Background job executor.
///
/// Polls a job store for ready jobs, runs them through registered handlers
/// and applies each job's retry policy on failure.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<String, JobHandler>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            handlers: HashMap::new(),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Register a handler for a job type name, a `prefix.*` pattern or `*`.
    pub fn register_handler<F, Fut>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| Box::pin(handler(job)));
        self.handlers.insert(kind_pattern.into(), handler);
    }

    fn get_handler(&self, type_name: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if type_name.starts_with(prefix) {
                    return Some(handler);
                }
            }
        }

        self.handlers.get("*")
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap().clone()
    }

    /// Run every job that is ready now, including retries that become ready
    /// immediately. Returns the number of executions.
    pub async fn run_ready(&self) -> Result<usize, JobStoreError> {
        let mut executed = 0;
        while let Some(mut job) = self.store.claim_next(self.clock.now())? {
            let _ = self.execute_one(&mut job).await;
            executed += 1;
        }
        Ok(executed)
    }

    /// Execute a job that has already been claimed.
    pub async fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let result = self.execute(job).await;

        let mut s = self.stats.lock().unwrap();
        s.jobs_processed += 1;
        match &result {
            Ok(()) => s.jobs_succeeded += 1,
            Err(_) => {
                s.jobs_failed += 1;
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    s.jobs_dead_lettered += 1;
                }
            }
        }
        result
    }

    async fn execute(&self, job: &mut Job) -> Result<(), String> {
        let started = self.clock.now();

        let outcome = match self.get_handler(job.kind.type_name()) {
            Some(handler) => handler(job.clone()).await,
            None => {
                warn!(job_id = %job.id, kind = job.kind.type_name(), "no handler for job");
                JobResult::Failure(format!("no handler for job kind: {}", job.kind.type_name()))
            }
        };

        let now = self.clock.now();
        match outcome {
            JobResult::Success => {
                job.mark_completed(started, now);
                self.store.update(job).map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, kind = job.kind.type_name(), "job completed");
                Ok(())
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started, now);
                self.store.update(job).map_err(|e| e.to_string())?;

                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    warn!(job_id = %job.id, error = %error, attempts = job.attempt, "job dead-lettered");
                    self.store
                        .dead_letter(job.clone(), error.clone(), now)
                        .map_err(|e| e.to_string())?;
                } else {
                    debug!(
                        job_id = %job.id,
                        error = %error,
                        attempt = job.attempt,
                        retry_at = ?job.scheduled_at,
                        "job failed, retry scheduled"
                    );
                }
                Err(error)
            }
        }
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(executor_loop(self, config, shutdown_rx));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn executor_loop(
    executor: JobExecutor,
    config: JobExecutorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(executor = %config.name, "job executor started");
    let start_time = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        executor.stats.lock().unwrap().uptime_secs = start_time.elapsed().as_secs();

        match executor.store.claim_next(executor.clock.now()) {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %config.name,
                    job_id = %job.id,
                    kind = job.kind.type_name(),
                    attempt = job.attempt,
                    "claimed job"
                );
                let _ = executor.execute_one(&mut job).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobKind, RetryPolicy};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(store: &Arc<InMemoryJobStore>, clock: &ManualClock) -> JobExecutor {
        JobExecutor::new(store.clone(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn execute_successful_job() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(Utc::now());
        let mut executor = executor(&store, &clock);
        executor.register_handler(JobKind::UNLOCK_BONUSES, |_job| async { JobResult::Success });

        let job_id = store.enqueue(Job::new(JobKind::UnlockBonuses, clock.now())).unwrap();

        assert_eq!(executor.run_ready().await.unwrap(), 1);
        let job = store.get(job_id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(executor.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn failing_job_backs_off_then_dead_letters() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(Utc::now());
        let mut executor = executor(&store, &clock);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        executor.register_handler("*", move |_job| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { JobResult::Failure("chain unavailable".to_string()) }
        });

        let job = Job::new(JobKind::UnlockBonuses, clock.now())
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(5)));
        let job_id = store.enqueue(job).unwrap();

        assert_eq!(executor.run_ready().await.unwrap(), 1);
        assert!(matches!(store.get(job_id).unwrap().unwrap().status, JobStatus::Failed { .. }));

        // Backoff not elapsed yet.
        assert_eq!(executor.run_ready().await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(executor.run_ready().await.unwrap(), 1);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(store.get(job_id).unwrap().is_none());
        assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);
        assert_eq!(executor.stats().jobs_dead_lettered, 1);
    }

    #[tokio::test]
    async fn exact_match_wins_over_wildcard() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(Utc::now());
        let mut executor = executor(&store, &clock);
        executor.register_handler("*", |_job| async { JobResult::Failure("wrong handler".into()) });
        executor.register_handler(JobKind::UNLOCK_BONUSES, |_job| async { JobResult::Success });

        store.enqueue(Job::new(JobKind::UnlockBonuses, clock.now())).unwrap();
        executor.run_ready().await.unwrap();

        assert_eq!(executor.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn missing_handler_counts_as_failure() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(Utc::now());
        let executor = executor(&store, &clock);

        let job = Job::new(JobKind::UnlockBonuses, clock.now()).with_retry_policy(RetryPolicy::no_retry());
        store.enqueue(job).unwrap();
        executor.run_ready().await.unwrap();

        assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spawned_loop_drains_queue_and_stops() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::new(Utc::now());
        let mut executor = executor(&store, &clock);
        executor.register_handler(JobKind::UNLOCK_BONUSES, |_job| async { JobResult::Success });

        let job_id = store.enqueue(Job::new(JobKind::UnlockBonuses, clock.now())).unwrap();
        let handle = executor.spawn(
            JobExecutorConfig::default().with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..200 {
            if matches!(store.get(job_id).unwrap().map(|j| j.status), Some(JobStatus::Completed)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(handle.stats().jobs_succeeded, 1);
        handle.shutdown().await;
    }
}
