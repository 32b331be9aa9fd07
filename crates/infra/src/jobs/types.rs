//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vaultledger_core::{GrowthJobId, WithdrawalId};

use crate::clock::after;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deferred settlement work, routed to a handler by `type_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobKind {
    /// Distribute one growth job page by page until complete.
    DistributeGrowth { growth_job_id: GrowthJobId },
    /// Pay one withdrawal request out on chain.
    Payout { withdrawal_id: WithdrawalId },
    /// Run one referral bonus unlock pass.
    UnlockBonuses,
}

impl JobKind {
    pub const DISTRIBUTE_GROWTH: &'static str = "distribute_growth";
    pub const PAYOUT: &'static str = "payout";
    pub const UNLOCK_BONUSES: &'static str = "unlock_bonuses";

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::DistributeGrowth { .. } => Self::DISTRIBUTE_GROWTH,
            JobKind::Payout { .. } => Self::PAYOUT,
            JobKind::UnlockBonuses => Self::UNLOCK_BONUSES,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries, moved to DLQ
    DeadLettered { error: String, attempts: u32 },
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
///
/// `max_attempts` counts every execution, the first one included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) spread around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic spread so retries of the same attempt do not align.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another execution may follow `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Executions so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may run.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| now >= at)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.record(started_at, now, None);
    }

    /// Record a failed execution and either schedule the retry the policy
    /// allows or give up.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.updated_at = now;
        self.record(started_at, now, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(after(now, delay));
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    fn record(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<String>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Result of job execution.
#[derive(Debug)]
pub enum JobResult {
    Success,
    /// Counts as an attempt; retried per the job's policy.
    Failure(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            job,
            dead_lettered_at: at,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payout_job(now: DateTime<Utc>) -> Job {
        Job::new(
            JobKind::Payout {
                withdrawal_id: WithdrawalId::new(),
            },
            now,
        )
    }

    #[test]
    fn job_kind_is_tagged_by_type_name() {
        let growth_job_id = GrowthJobId::new();
        let value = serde_json::to_value(JobKind::DistributeGrowth { growth_job_id }).unwrap();
        assert_eq!(value["type"], JobKind::DISTRIBUTE_GROWTH);
        assert_eq!(value["growth_job_id"], growth_job_id.to_string());

        let back: JobKind = serde_json::from_value(serde_json::json!({ "type": "unlock_bonuses" })).unwrap();
        assert_eq!(back, JobKind::UnlockBonuses);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(1000), Duration::from_secs(60))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(60));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1500));
    }

    #[test]
    fn should_retry_counts_every_execution() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn kinds_route_by_type_name() {
        let growth = JobKind::DistributeGrowth {
            growth_job_id: GrowthJobId::new(),
        };
        assert_eq!(growth.type_name(), "distribute_growth");
        assert_eq!(JobKind::UnlockBonuses.type_name(), "unlock_bonuses");
    }

    #[test]
    fn scheduled_job_waits_for_its_time() {
        let now = Utc::now();
        let job = payout_job(now).scheduled_at(now + chrono::Duration::seconds(60));

        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = payout_job(now);

        job.mark_running(now);
        assert!(matches!(job.status, JobStatus::Running));
        assert_eq!(job.attempt, 1);

        job.mark_completed(now, now + chrono::Duration::milliseconds(5));
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert_eq!(job.history[0].duration_ms, 5);
    }

    #[test]
    fn failures_exhaust_into_dead_letter() {
        let now = Utc::now();
        let mut job = payout_job(now).with_retry_policy(RetryPolicy::fixed(2, Duration::from_secs(1)));

        job.mark_running(now);
        job.mark_failed("node down".to_string(), now, now);
        assert!(matches!(job.status, JobStatus::Failed { attempt: 1, .. }));
        assert_eq!(job.scheduled_at, Some(now + chrono::Duration::seconds(1)));

        job.mark_running(now);
        job.mark_failed("node down".to_string(), now, now);
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
    }
}
