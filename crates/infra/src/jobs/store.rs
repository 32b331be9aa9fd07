//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest pending or failed job that is ready at `now`.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    fn dead_letter(&self, job: Job, reason: String, at: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Oldest dead letters first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();

        // Oldest ready job first.
        let next = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Failed { .. }) && j.is_ready(now)
            })
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_running(now);
            Some(job.clone())
        }))
    }

    fn dead_letter(&self, mut job: Job, reason: String, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let mut dls = self.dead_letters.write().unwrap();

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = at;

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason, at));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().unwrap();
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let dls = self.dead_letters.read().unwrap();

        let mut stats = JobStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.len();

        Ok(stats)
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn dead_letter(&self, job: Job, reason: String, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason, at)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;
    use chrono::Duration;

    fn unlock_job(at: DateTime<Utc>) -> Job {
        Job::new(JobKind::UnlockBonuses, at)
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job_id = store.enqueue(unlock_job(now)).unwrap();

        let claimed = store.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        assert!(store.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn claim_is_fifo_and_respects_schedule() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let later = unlock_job(now).scheduled_at(now + Duration::hours(1));
        let first = unlock_job(now + Duration::seconds(1));
        let second = unlock_job(now + Duration::seconds(2));
        let later_id = store.enqueue(later).unwrap();
        let first_id = store.enqueue(first).unwrap();
        let second_id = store.enqueue(second).unwrap();

        assert_eq!(store.claim_next(now).unwrap().unwrap().id, first_id);
        assert_eq!(store.claim_next(now).unwrap().unwrap().id, second_id);
        assert!(store.claim_next(now).unwrap().is_none());
        assert_eq!(
            store.claim_next(now + Duration::hours(1)).unwrap().unwrap().id,
            later_id
        );
    }

    #[test]
    fn dead_letter_flow() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let job = unlock_job(now);
        let job_id = job.id;
        store.enqueue(job).unwrap();

        let mut claimed = store.claim_next(now).unwrap().unwrap();
        claimed.mark_failed("boom".to_string(), now, now);
        store.dead_letter(claimed, "max retries exceeded".to_string(), now).unwrap();

        assert!(store.get(job_id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);
        assert_eq!(dls[0].reason, "max retries exceeded");
        assert!(matches!(dls[0].job.status, JobStatus::DeadLettered { attempts: 1, .. }));
        assert_eq!(store.stats().unwrap().dead_lettered, 1);
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        for i in 0..5 {
            store.enqueue(unlock_job(now + Duration::seconds(i))).unwrap();
        }
        assert_eq!(store.stats().unwrap().pending, 5);

        store.claim_next(now + Duration::seconds(10)).unwrap();
        store.claim_next(now + Duration::seconds(10)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
    }
}
