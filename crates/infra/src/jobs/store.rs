//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use fhirmat_core::WorkerId;

use super::payload::JobPayload;
use super::types::{Job, JobId, JobRetention, JobStatus, SubmitOptions};

/// Persisted queue of work items.
///
/// This is the only sanctioned way to enqueue or consume work. Implementations
/// must make `claim_next` exclusive: two concurrent callers never receive the
/// same job.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job.
    ///
    /// Returns `None` when `options.discriminant` collapses the submission into
    /// an already pending or claimed job with the same topic.
    async fn submit(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Claim the highest-priority, oldest ready job whose topic is in `topics`.
    async fn claim_next(
        &self,
        worker: WorkerId,
        topics: &[String],
    ) -> Result<Option<Job>, JobStoreError>;

    /// Mark a job claimed by `worker` done (or delete it, per retention).
    ///
    /// This and the other claim transitions fail with
    /// [`JobStoreError::ClaimLost`] once the claim has passed to another worker.
    async fn complete(&self, job_id: JobId, worker: WorkerId) -> Result<(), JobStoreError>;

    /// Mark a claimed job failed with its error text.
    async fn fail(&self, job_id: JobId, worker: WorkerId, error: &str) -> Result<(), JobStoreError>;

    /// Return a claimed job to the queue, claimable again from `run_after`.
    async fn retry(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Hand a claimed job back untouched, refunding the attempt its claim took.
    async fn release(&self, job_id: JobId, worker: WorkerId) -> Result<(), JobStoreError>;

    /// Outstanding (pending + claimed) jobs, optionally for one topic.
    async fn count_queue(&self, topic: Option<&str>) -> Result<u64, JobStoreError>;

    /// Release claims taken before `claimed_before`; returns how many.
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Submit a typed payload on its own topic.
    async fn submit_payload(
        &self,
        payload: &JobPayload,
        options: SubmitOptions,
    ) -> Result<Option<Job>, JobStoreError> {
        self.submit(payload.topic(), payload.to_value(), options).await
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {status:?}, expected it to be claimed")]
    NotClaimed { id: JobId, status: JobStatus },
    #[error("job {id} is no longer claimed by worker {worker}")]
    ClaimLost { id: JobId, worker: WorkerId },
    #[error("failed to decode job row: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    retention: JobRetention,
    submit_calls: AtomicU64,
    bulk_insert_calls: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_retention(JobRetention::default())
    }

    pub fn with_retention(retention: JobRetention) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
            submit_calls: AtomicU64::new(0),
            bulk_insert_calls: AtomicU64::new(0),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of `submit` calls (row-at-a-time inserts) seen so far.
    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::Relaxed)
    }

    /// Number of bulk insert statements seen so far.
    pub fn bulk_insert_calls(&self) -> u64 {
        self.bulk_insert_calls.load(Ordering::Relaxed)
    }

    /// Snapshot of every job currently held, oldest first.
    pub fn all(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock()?;
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.created_at, j.id));
        Ok(all)
    }

    /// Insert many pending jobs as a single statement.
    ///
    /// Bulk inserts bypass discriminant dedup, as the backfill SQL does.
    pub(crate) fn insert_bulk(&self, batch: Vec<Job>) -> Result<u64, JobStoreError> {
        self.bulk_insert_calls.fetch_add(1, Ordering::Relaxed);
        let mut jobs = self.lock()?;
        let count = batch.len() as u64;
        for job in batch {
            jobs.insert(job.id, job);
        }
        Ok(count)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn claimed_mut(
    jobs: &mut HashMap<JobId, Job>,
    job_id: JobId,
    worker: WorkerId,
) -> Result<&mut Job, JobStoreError> {
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    if job.status != JobStatus::Claimed {
        return Err(JobStoreError::NotClaimed {
            id: job_id,
            status: job.status,
        });
    }
    if job.claimed_by != Some(worker) {
        return Err(JobStoreError::ClaimLost { id: job_id, worker });
    }
    Ok(job)
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Option<Job>, JobStoreError> {
        self.submit_calls.fetch_add(1, Ordering::Relaxed);
        let mut jobs = self.lock()?;

        if let Some(discriminant) = options.discriminant.as_deref() {
            let collapsed = jobs.values().any(|j| {
                j.topic == topic
                    && j.status.is_outstanding()
                    && j.discriminant.as_deref() == Some(discriminant)
            });
            if collapsed {
                return Ok(None);
            }
        }

        let job = Job::new(topic, payload, options);
        jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn claim_next(
        &self,
        worker: WorkerId,
        topics: &[String],
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_ready(now) && topics.iter().any(|t| *t == j.topic))
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.created_at, j.id))
            .map(|j| j.id);

        match next.and_then(|id| jobs.get_mut(&id)) {
            Some(job) => {
                job.mark_claimed(worker, now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, job_id: JobId, worker: WorkerId) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        claimed_mut(&mut jobs, job_id, worker)?.mark_done();
        if self.retention == JobRetention::Delete {
            jobs.remove(&job_id);
        }
        Ok(())
    }

    async fn fail(&self, job_id: JobId, worker: WorkerId, error: &str) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        claimed_mut(&mut jobs, job_id, worker)?.mark_failed(error);
        Ok(())
    }

    async fn retry(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        claimed_mut(&mut jobs, job_id, worker)?.mark_retry(error, run_after);
        Ok(())
    }

    async fn release(&self, job_id: JobId, worker: WorkerId) -> Result<(), JobStoreError> {
        let mut jobs = self.lock()?;
        claimed_mut(&mut jobs, job_id, worker)?.mark_released();
        Ok(())
    }

    async fn count_queue(&self, topic: Option<&str>) -> Result<u64, JobStoreError> {
        let jobs = self.lock()?;
        Ok(jobs
            .values()
            .filter(|j| j.status.is_outstanding() && topic.is_none_or(|t| j.topic == t))
            .count() as u64)
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.lock()?;
        let mut released = 0;
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Claimed
                && job.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                job.release_claim();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.lock()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Claimed => stats.claimed += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
