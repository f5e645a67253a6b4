//! Polling worker: claims jobs for registered topics and runs their handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use fhirmat_core::WorkerId;

use super::payload::PayloadError;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, RetryPolicy};
use crate::context::FhirContext;
use crate::refresh::RefreshError;
use crate::resolver::ResolverError;
use crate::resources::{CatalogError, MaterialiseError, StoreError};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Type-erased async job handler.
pub type JobHandler = Arc<dyn Fn(Job, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Why a handler did not complete its job.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Materialise(#[from] MaterialiseError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error("resource {resource} does not support {capability:?}")]
    Unsupported {
        resource: String,
        capability: fhirmat_core::Capability,
    },
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// The worker is stopping; the job goes back to the queue untouched.
    #[error("worker shutting down")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Retrying cannot help: the payload or the catalogue is wrong.
    pub fn is_permanent(&self) -> bool {
        match self {
            HandlerError::Payload(_) | HandlerError::Catalog(_) | HandlerError::Unsupported { .. } => true,
            HandlerError::Resolver(ResolverError::Cycle(_)) => true,
            HandlerError::Refresh(RefreshError::Catalog(_) | RefreshError::NotMaterialisable(_)) => true,
            HandlerError::Materialise(MaterialiseError::Catalog(_)) => true,
            _ => false,
        }
    }
}

/// What a handler gets besides its job.
#[derive(Clone)]
pub struct HandlerContext {
    worker_id: WorkerId,
    fhir: Arc<FhirContext>,
    shutdown: watch::Receiver<bool>,
}

impl HandlerContext {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Catalogue, stores and settings.
    pub fn fhir(&self) -> &Arc<FhirContext> {
        &self.fhir
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep on this job's own task, waking early with `Cancelled` when the
    /// worker stops.
    pub async fn sleep(&self, duration: Duration) -> Result<(), HandlerError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(HandlerError::Cancelled);
        }

        let stopped = async move {
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                // Sender gone without a stop signal: nothing can cancel us.
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = stopped => Err(HandlerError::Cancelled),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll when the queue is empty
    pub poll_interval: Duration,
    /// Maximum jobs claimed per topic per iteration
    pub concurrency: usize,
    /// Claims older than this are returned to the queue
    pub claim_timeout: Option<Duration>,
    /// Handlers running longer than this are aborted
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "fhir-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            concurrency: 100,
            claim_timeout: Some(Duration::from_secs(600)),
            job_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Option<Duration>) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Option<Duration>) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_timed_out: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    running: AtomicUsize,
}

impl StatsCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_timed_out: self.timed_out.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct Route {
    handler: JobHandler,
    retry: Option<RetryPolicy>,
}

/// Everything one topic's pass needs, detached from the worker so topics can
/// run side by side.
#[derive(Clone)]
struct TopicRunner {
    topic: String,
    route: Route,
    worker_id: WorkerId,
    worker_name: String,
    store: Arc<dyn JobStore>,
    context: Arc<FhirContext>,
    concurrency: usize,
    job_timeout: Option<Duration>,
    stats: Arc<StatsCounters>,
    shutdown: watch::Receiver<bool>,
}

enum Outcome {
    Done,
    Failed { message: String, permanent: bool },
    TimedOut(Duration),
    Cancelled,
}

impl TopicRunner {
    /// Claim up to `concurrency` jobs and wait for all of them.
    async fn run_once(&self) -> Result<usize, JobStoreError> {
        let topics = [self.topic.clone()];
        let mut running = JoinSet::new();
        let mut claim_error = None;

        while running.len() < self.concurrency {
            match self.store.claim_next(self.worker_id, &topics).await {
                Ok(Some(job)) => {
                    debug!(worker = %self.worker_name, job_id = %job.id, topic = %job.topic, "claimed job");
                    let runner = self.clone();
                    running.spawn(async move { runner.run_job(job).await });
                }
                Ok(None) => break,
                Err(e) => {
                    claim_error = Some(e);
                    break;
                }
            }
        }

        // Dropping the set would abort the handlers already claimed.
        let claimed = running.len();
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(worker = %self.worker_name, topic = %self.topic, error = %e, "job task aborted");
            }
        }

        match claim_error {
            Some(e) if claimed == 0 => Err(e),
            Some(e) => {
                error!(worker = %self.worker_name, topic = %self.topic, error = %e, "failed to claim job");
                Ok(claimed)
            }
            None => Ok(claimed),
        }
    }

    async fn run_job(&self, job: Job) {
        self.stats.running.fetch_add(1, Ordering::Relaxed);

        let span = info_span!("job", job_id = %job.id, topic = %job.topic, attempt = job.attempts);
        let ctx = HandlerContext {
            worker_id: self.worker_id,
            fhir: self.context.clone(),
            shutdown: self.shutdown.clone(),
        };

        // Spawned separately so a panic surfaces as a JoinError instead of
        // unwinding through the worker.
        let mut task = tokio::spawn((self.route.handler)(job.clone(), ctx).instrument(span.clone()));

        let outcome = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined_outcome(joined),
                Err(_) => {
                    task.abort();
                    Outcome::TimedOut(limit)
                }
            },
            None => joined_outcome(task.await),
        };

        match self.report(&job, outcome).instrument(span).await {
            Ok(()) => {}
            Err(e @ JobStoreError::ClaimLost { .. }) => {
                warn!(worker = %self.worker_name, job_id = %job.id, error = %e, "claim was reclaimed, outcome dropped");
            }
            Err(e) => {
                error!(worker = %self.worker_name, job_id = %job.id, error = %e, "failed to record job outcome");
            }
        }

        self.stats.running.fetch_sub(1, Ordering::Relaxed);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn report(&self, job: &Job, outcome: Outcome) -> Result<(), JobStoreError> {
        let (message, permanent) = match outcome {
            Outcome::Done => {
                self.store.complete(job.id, self.worker_id).await?;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("job completed");
                return Ok(());
            }
            Outcome::Cancelled => {
                self.store.release(job.id, self.worker_id).await?;
                info!("job returned to queue on shutdown");
                return Ok(());
            }
            Outcome::TimedOut(limit) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                (HandlerError::Timeout(limit).to_string(), false)
            }
            Outcome::Failed { message, permanent } => (message, permanent),
        };

        let retry = self.route.retry.as_ref().filter(|p| !permanent && p.should_retry(job.attempts));
        match retry {
            Some(policy) => {
                let delay = policy.delay_for_attempt(job.attempts);
                let run_after = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                self.store.retry(job.id, self.worker_id, &message, run_after).await?;
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                warn!(error = %message, retry_in = ?delay, "job failed, will retry");
            }
            None => {
                self.store.fail(job.id, self.worker_id, &message).await?;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %message, "job failed");
            }
        }
        Ok(())
    }
}

fn joined_outcome(joined: Result<Result<(), HandlerError>, tokio::task::JoinError>) -> Outcome {
    match joined {
        Ok(Ok(())) => Outcome::Done,
        Ok(Err(HandlerError::Cancelled)) => Outcome::Cancelled,
        Ok(Err(e)) => Outcome::Failed {
            message: e.to_string(),
            permanent: e.is_permanent(),
        },
        Err(e) if e.is_panic() => Outcome::Failed {
            message: HandlerError::Panicked(panic_message(e)).to_string(),
            permanent: false,
        },
        Err(e) => Outcome::Failed {
            message: e.to_string(),
            permanent: false,
        },
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Background job worker.
///
/// Register handlers with [`Worker::set_handler`], then either drive it by hand
/// with [`Worker::process_queue_now`] or hand it to a background loop with
/// [`Worker::start`].
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    context: Arc<FhirContext>,
    routes: HashMap<String, Route>,
    stats: Arc<StatsCounters>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(context: Arc<FhirContext>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        Self {
            id: WorkerId::new(),
            config,
            context,
            routes: HashMap::new(),
            stats: Arc::new(StatsCounters::default()),
            shutdown,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<FhirContext> {
        &self.context
    }

    /// Register the handler for a topic, replacing any previous one.
    pub fn set_handler<F, Fut>(&mut self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Job, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job, ctx| Box::pin(handler(job, ctx)));
        let topic = topic.into();
        let retry = self.routes.get(&topic).and_then(|r| r.retry.clone());
        self.routes.insert(topic, Route { handler, retry });
    }

    /// Topic-level retry policy. Only applies to topics with a handler.
    pub fn set_retry_policy(&mut self, topic: &str, policy: RetryPolicy) {
        if let Some(route) = self.routes.get_mut(topic) {
            route.retry = Some(policy);
        }
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    fn runner(&self, topic: &str) -> Option<TopicRunner> {
        let route = self.routes.get(topic)?.clone();
        Some(TopicRunner {
            topic: topic.to_string(),
            route,
            worker_id: self.id,
            worker_name: self.config.name.clone(),
            store: self.context.jobs.clone(),
            context: self.context.clone(),
            concurrency: self.config.concurrency.max(1),
            job_timeout: self.config.job_timeout,
            stats: self.stats.clone(),
            shutdown: self.shutdown.subscribe(),
        })
    }

    /// One pass over a single topic. Returns how many jobs were run.
    pub async fn process_queue(&self, topic: &str) -> Result<usize, JobStoreError> {
        match self.runner(topic) {
            Some(runner) => runner.run_once().await,
            None => Ok(0),
        }
    }

    /// Sweep stale claims, then run one pass over every topic side by side.
    pub async fn process_queue_now(&self) -> Result<usize, JobStoreError> {
        self.reclaim_stale().await?;

        let mut passes = JoinSet::new();
        for topic in self.routes.keys() {
            if let Some(runner) = self.runner(topic) {
                passes.spawn(async move { runner.run_once().await });
            }
        }

        let mut processed = 0;
        let mut first_error = None;
        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok(Ok(n)) => processed += n,
                Ok(Err(e)) => {
                    error!(worker = %self.config.name, error = %e, "failed to claim jobs");
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(worker = %self.config.name, error = %e, "topic pass aborted"),
            }
        }

        match first_error {
            Some(e) if processed == 0 => Err(e),
            _ => Ok(processed),
        }
    }

    async fn reclaim_stale(&self) -> Result<(), JobStoreError> {
        let Some(timeout) = self.config.claim_timeout else {
            return Ok(());
        };
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let released = self.context.jobs.reclaim_stale(cutoff).await?;
        if released > 0 {
            warn!(worker = %self.config.name, released, "released stale job claims");
        }
        Ok(())
    }

    /// Run the polling loop on the tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let shutdown = self.shutdown.clone();
        let wake = Arc::new(Notify::new());
        let stats = self.stats.clone();
        let loop_wake = wake.clone();

        let join = tokio::spawn(async move { worker_loop(self, loop_wake).await });

        WorkerHandle {
            shutdown,
            wake,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop(worker: Worker, wake: Arc<Notify>) {
    let mut shutdown = worker.shutdown.subscribe();
    info!(
        worker = %worker.config.name,
        worker_id = %worker.id,
        topics = ?worker.topics(),
        concurrency = worker.config.concurrency,
        "worker started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let drained = match worker.process_queue_now().await {
            Ok(n) => n,
            Err(e) => {
                error!(worker = %worker.config.name, error = %e, "worker iteration failed");
                0
            }
        };

        if drained > 0 {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(worker.config.poll_interval) => {}
            _ = wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(worker = %worker.config.name, worker_id = %worker.id, "worker stopped");
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    wake: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    stats: Arc<StatsCounters>,
}

impl WorkerHandle {
    /// Wake the loop now instead of at the next poll.
    pub fn process_queue_now(&self) {
        self.wake.notify_one();
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Stop after in-flight handlers finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "worker loop panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FhirSettings;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobRetention, JobStatus, SubmitOptions};
    use crate::resources::{InMemoryFhirStore, ResourceCatalog};
    use std::sync::atomic::AtomicU32;

    fn context() -> (Arc<FhirContext>, Arc<InMemoryJobStore>) {
        let store = InMemoryFhirStore::with_retention(JobRetention::Keep);
        let ctx = FhirContext::in_memory(ResourceCatalog::empty(), &store, FhirSettings::default());
        (Arc::new(ctx), store.jobs())
    }

    fn quick() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_concurrency(4)
    }

    async fn submit(jobs: &InMemoryJobStore, topic: &str) -> Job {
        jobs.submit(topic, serde_json::json!({}), SubmitOptions::default())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_job_is_completed() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        worker.set_handler("test", |_job, _ctx| async { Ok(()) });

        let job = submit(&jobs, "test").await;
        assert_eq!(worker.process_queue("test").await.unwrap(), 1);

        assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(worker.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn failing_handler_marks_job_failed_and_worker_continues() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        worker.set_handler("test", |job, _ctx| async move {
            if job.payload["bad"].as_bool() == Some(true) {
                Err(HandlerError::failed("bad job"))
            } else {
                Ok(())
            }
        });

        let bad = jobs
            .submit("test", serde_json::json!({"bad": true}), SubmitOptions::default())
            .await
            .unwrap()
            .unwrap();
        let good = submit(&jobs, "test").await;

        worker.process_queue("test").await.unwrap();

        let bad = jobs.get(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("bad job"));
        assert_eq!(jobs.get(good.id).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        worker.set_handler("boom", |_job, _ctx| async {
            panic!("kaboom");
        });

        let job = submit(&jobs, "boom").await;
        worker.process_queue("boom").await.unwrap();

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick().with_job_timeout(Some(Duration::from_millis(20))));
        worker.set_handler("slow", |_job, _ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let job = submit(&jobs, "slow").await;
        worker.process_queue("slow").await.unwrap();

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().contains("timed out"));
        assert_eq!(worker.stats().jobs_timed_out, 1);
    }

    #[tokio::test]
    async fn retry_policy_requeues_until_attempts_run_out() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        worker.set_handler("flaky", |_job, _ctx| async { Err(HandlerError::failed("nope")) });
        worker.set_retry_policy("flaky", RetryPolicy::fixed(2, Duration::ZERO));

        let job = submit(&jobs, "flaky").await;

        worker.process_queue("flaky").await.unwrap();
        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);

        worker.process_queue("flaky").await.unwrap();
        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn permanent_errors_skip_the_retry_policy() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        worker.set_handler("bad", |_job, _ctx| async {
            Err(HandlerError::Resolver(ResolverError::Cycle(vec!["X".into(), "Y".into()])))
        });
        worker.set_retry_policy("bad", RetryPolicy::fixed(5, Duration::ZERO));

        let job = submit(&jobs, "bad").await;
        worker.process_queue("bad").await.unwrap();

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(worker.stats().jobs_retried, 0);
    }

    #[test]
    fn only_configuration_errors_are_permanent() {
        assert!(HandlerError::Resolver(ResolverError::Cycle(vec![])).is_permanent());
        assert!(HandlerError::Refresh(RefreshError::NotMaterialisable("Location".into())).is_permanent());
        assert!(!HandlerError::Resolver(ResolverError::Deferred(2)).is_permanent());
        assert!(!HandlerError::failed("nope").is_permanent());
        assert!(!HandlerError::Timeout(Duration::from_secs(1)).is_permanent());
    }

    #[tokio::test]
    async fn claims_at_most_concurrency_jobs_per_pass() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick().with_concurrency(2));
        worker.set_handler("t", |_job, _ctx| async { Ok(()) });

        for _ in 0..5 {
            submit(&jobs, "t").await;
        }

        assert_eq!(worker.process_queue("t").await.unwrap(), 2);
        assert_eq!(jobs.count_queue(Some("t")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn topics_are_serviced_side_by_side() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        let seen = Arc::new(AtomicU32::new(0));

        for topic in ["a", "b"] {
            let seen = seen.clone();
            worker.set_handler(topic, move |_job, _ctx| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            submit(&jobs, topic).await;
        }
        submit(&jobs, "unhandled").await;

        assert_eq!(worker.process_queue_now().await.unwrap(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(jobs.count_queue(Some("unhandled")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn started_worker_drains_and_stops() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick());
        worker.set_handler("t", |_job, _ctx| async { Ok(()) });
        let job = submit(&jobs, "t").await;

        let handle = worker.start();
        handle.process_queue_now();

        for _ in 0..100 {
            if jobs.get(job.id).await.unwrap().unwrap().status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);

        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_handler_sleep_and_requeues_job() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick().with_job_timeout(None));
        worker.set_handler("sleepy", |_job, ctx| async move {
            ctx.sleep(Duration::from_secs(3600)).await?;
            Ok(())
        });
        let job = submit(&jobs, "sleepy").await;

        let handle = worker.start();
        for _ in 0..100 {
            if jobs.get(job.id).await.unwrap().unwrap().status == JobStatus::Claimed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop().await;

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.claimed_by.is_none());
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn shutdown_requeues_do_not_spend_retry_budget() {
        let (ctx, jobs) = context();
        let job = submit(&jobs, "sleepy").await;

        for _ in 0..3 {
            let mut worker = Worker::new(ctx.clone(), quick().with_job_timeout(None));
            worker.set_handler("sleepy", |_job, ctx| async move {
                ctx.sleep(Duration::from_secs(3600)).await?;
                Ok(())
            });
            worker.set_retry_policy("sleepy", RetryPolicy::fixed(1, Duration::ZERO));

            let handle = worker.start();
            for _ in 0..100 {
                if jobs.get(job.id).await.unwrap().unwrap().status == JobStatus::Claimed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            handle.stop().await;
        }

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn outcome_of_a_reclaimed_job_is_dropped() {
        let (ctx, jobs) = context();
        let mut worker = Worker::new(ctx, quick().with_job_timeout(None));
        let store = jobs.clone();
        worker.set_handler("slow", move |job, _ctx| {
            let store = store.clone();
            async move {
                // Another worker takes the job over while this one is still running it.
                store.reclaim_stale(Utc::now() + chrono::Duration::seconds(1)).await?;
                store.claim_next(WorkerId::new(), &[job.topic.clone()]).await?;
                Ok(())
            }
        });
        let job = submit(&jobs, "slow").await;

        worker.process_queue("slow").await.unwrap();

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Claimed);
        assert_ne!(stored.claimed_by, Some(worker.id()));
        assert_eq!(worker.stats().jobs_succeeded, 0);
    }
}
