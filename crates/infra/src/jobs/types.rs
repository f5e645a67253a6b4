//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fhirmat_core::WorkerId;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker, handler running
    Claimed,
    /// Completed successfully (only kept under `JobRetention::Keep`)
    Done,
    /// Handler failed; error text is on the job
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "claimed" => Some(JobStatus::Claimed),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Pending or claimed: counts against the discriminant dedup.
    pub fn is_outstanding(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Claimed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Claim priority; higher values are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

impl JobPriority {
    pub const HIGH: JobPriority = JobPriority(1000);
    pub const DEFAULT: JobPriority = JobPriority(500);
    pub const LOW: JobPriority = JobPriority(100);
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What happens to a job row once its handler succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRetention {
    /// Delete completed jobs (the queue only ever holds outstanding and failed work).
    #[default]
    Delete,
    /// Keep completed jobs with status `done`.
    Keep,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Topic-level retry policy.
///
/// Topics without a policy never retry: a failing handler marks the job failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
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
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
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
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that has already run `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Options accepted by `JobStore::submit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Collapse key: at most one pending/claimed job per `(topic, discriminant)`.
    pub discriminant: Option<String>,
    pub priority: JobPriority,
}

impl SubmitOptions {
    pub fn discriminant(mut self, discriminant: impl Into<String>) -> Self {
        self.discriminant = Some(discriminant.into());
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing key; the worker dispatches on this
    pub topic: String,
    /// Topic-specific payload, decoded by `JobPayload::decode`
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of times the job has been claimed
    pub attempts: u32,
    pub priority: JobPriority,
    pub discriminant: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff)
    pub run_after: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
    pub error: Option<String>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, options: SubmitOptions) -> Self {
        Self {
            id: JobId::new(),
            topic: topic.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            priority: options.priority,
            discriminant: options.discriminant,
            created_at: Utc::now(),
            run_after: None,
            claimed_at: None,
            claimed_by: None,
            error: None,
        }
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after.is_none_or(|at| now >= at)
    }

    pub fn mark_claimed(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.attempts += 1;
        self.claimed_at = Some(now);
        self.claimed_by = Some(worker);
    }

    pub fn mark_done(&mut self) {
        self.status = JobStatus::Done;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
    }

    /// Put the job back in the queue, invisible until `run_after`.
    pub fn mark_retry(&mut self, error: impl Into<String>, run_after: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.error = Some(error.into());
        self.run_after = Some(run_after);
        self.claimed_at = None;
        self.claimed_by = None;
    }

    /// Back to the queue as if never claimed.
    pub fn mark_released(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
        self.release_claim();
    }

    /// Release a claim that outlived the claim timeout.
    pub fn release_claim(&mut self) {
        self.status = JobStatus::Pending;
        self.claimed_at = None;
        self.claimed_by = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_counts_the_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Claimed,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("grabbed"), None);
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("test", serde_json::json!({"key": "value"}), SubmitOptions::default());
        let worker = WorkerId::new();
        let now = Utc::now();

        assert!(job.is_ready(now));
        assert_eq!(job.priority, JobPriority::DEFAULT);

        job.mark_claimed(worker, now);
        assert_eq!(job.status, JobStatus::Claimed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.claimed_by, Some(worker));
        assert!(!job.is_ready(now));

        job.mark_retry("boom", now + chrono::Duration::seconds(30));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(31)));

        job.mark_claimed(worker, now);
        job.mark_failed("boom again");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error.as_deref(), Some("boom again"));
    }
}
