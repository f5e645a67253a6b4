//! FHIR topic handlers and worker topologies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fhirmat_core::Capability;

use crate::jobs::{
    HandlerContext, HandlerError, Job, JobPayload, RESOLVER_DISCRIMINANT, SubmitOptions, Worker,
    topics,
};
use crate::refresh::{refresh_all_from_upstream, refresh_entire_resource};
use crate::resolver::{DependencyResolver, ResolverError};
use crate::resources::materialise_from_upstream;

/// Which FHIR topics a worker process services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTopology {
    /// One worker for every topic.
    #[default]
    All,
    /// Only `fhir.resolver`.
    Resolver,
    /// Only the `fhir.refresh.*` topics.
    Refresh,
}

impl WorkerTopology {
    pub fn topics(self) -> Vec<&'static str> {
        match self {
            WorkerTopology::All => topics::REFRESH_TOPICS
                .iter()
                .chain(topics::RESOLVER_TOPICS)
                .copied()
                .collect(),
            WorkerTopology::Resolver => topics::RESOLVER_TOPICS.to_vec(),
            WorkerTopology::Refresh => topics::REFRESH_TOPICS.to_vec(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerTopology::All => "all",
            WorkerTopology::Resolver => "resolver",
            WorkerTopology::Refresh => "refresh",
        }
    }
}

impl fmt::Display for WorkerTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerTopology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(WorkerTopology::All),
            "resolver" => Ok(WorkerTopology::Resolver),
            "refresh" => Ok(WorkerTopology::Refresh),
            other => Err(format!("unknown worker topology: {other}")),
        }
    }
}

/// Register the handlers for `topology` and apply configured retry policies.
pub fn register_fhir_handlers(
    worker: &mut Worker,
    topology: WorkerTopology,
    resolver: Arc<DependencyResolver>,
) {
    for topic in topology.topics() {
        match topic {
            topics::FROM_UPSTREAM => worker.set_handler(topic, handle_from_upstream),
            topics::ALL_FROM_UPSTREAM => worker.set_handler(topic, handle_all_from_upstream),
            topics::ENTIRE_RESOURCE => worker.set_handler(topic, handle_entire_resource),
            topics::RESOLVER => {
                let resolver = resolver.clone();
                worker.set_handler(topic, move |job, ctx| {
                    let resolver = resolver.clone();
                    async move { handle_resolver(job, ctx, resolver).await }
                });
            }
            _ => {}
        }
    }

    let policies: Vec<_> = topology
        .topics()
        .into_iter()
        .filter_map(|topic| {
            let policy = worker.context().settings.retry_policy(topic)?;
            Some((topic, policy))
        })
        .collect();
    for (topic, policy) in policies {
        worker.set_retry_policy(topic, policy);
    }

    info!(worker = %worker.config().name, topology = %topology, topics = ?worker.topics(), "registered FHIR handlers");
}

fn decode(job: &Job) -> Result<JobPayload, HandlerError> {
    Ok(JobPayload::decode(&job.topic, &job.payload)?)
}

fn unexpected(job: &Job) -> HandlerError {
    HandlerError::failed(format!("unexpected payload for topic {}", job.topic))
}

async fn handle_from_upstream(job: Job, ctx: HandlerContext) -> Result<(), HandlerError> {
    let JobPayload::FromUpstream(payload) = decode(&job)? else {
        return Err(unexpected(&job));
    };
    let fhir = ctx.fhir();
    let def = fhir.catalog.get(&payload.resource)?;
    if !def.can_do(Capability::Materialise) {
        return Err(HandlerError::Unsupported {
            resource: payload.resource,
            capability: Capability::Materialise,
        });
    }

    let done =
        materialise_from_upstream(def.as_ref(), fhir.resources.as_ref(), fhir, &payload.upstream_id)
            .await?;
    debug!(
        resource = %payload.resource,
        upstream_id = %payload.upstream_id,
        version_id = %done.version_id,
        changed = done.changed,
        "materialised"
    );

    fhir.jobs
        .submit_payload(
            &JobPayload::Resolver,
            SubmitOptions::default().discriminant(RESOLVER_DISCRIMINANT),
        )
        .await?;
    Ok(())
}

async fn handle_all_from_upstream(job: Job, ctx: HandlerContext) -> Result<(), HandlerError> {
    let JobPayload::AllFromUpstream(payload) = decode(&job)? else {
        return Err(unexpected(&job));
    };
    refresh_all_from_upstream(ctx.fhir(), &payload).await?;
    Ok(())
}

async fn handle_entire_resource(job: Job, ctx: HandlerContext) -> Result<(), HandlerError> {
    let JobPayload::EntireResource(payload) = decode(&job)? else {
        return Err(unexpected(&job));
    };
    refresh_entire_resource(ctx.fhir(), &payload.resource).await?;
    Ok(())
}

async fn handle_resolver(
    _job: Job,
    ctx: HandlerContext,
    resolver: Arc<DependencyResolver>,
) -> Result<(), HandlerError> {
    ctx.sleep(ctx.fhir().settings.resolver_delay()).await?;
    let pass = resolver.run(ctx.fhir()).await?;
    if !pass.deferred.is_empty() {
        return Err(ResolverError::Deferred(pass.deferred.len()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FhirSettings;
    use crate::context::FhirContext;
    use crate::jobs::{InMemoryJobStore, JobRetention, JobStatus, JobStore, WorkerConfig};
    use crate::resources::{DeclaredResource, InMemoryFhirStore, ResourceCatalog};
    use fhirmat_core::CapabilitySet;
    use serde_json::json;
    use std::time::Duration;

    fn worker(catalog: ResourceCatalog, settings: FhirSettings) -> (Worker, InMemoryFhirStore, Arc<InMemoryJobStore>) {
        let store = InMemoryFhirStore::with_retention(JobRetention::Keep);
        let ctx = Arc::new(FhirContext::in_memory(catalog, &store, settings));
        let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(10));
        let mut worker = Worker::new(ctx, config);
        register_fhir_handlers(&mut worker, WorkerTopology::All, Arc::new(DependencyResolver::new()));
        let jobs = store.jobs();
        (worker, store, jobs)
    }

    fn immediate() -> FhirSettings {
        let mut settings = FhirSettings::default();
        settings.resolver.delay_ms = 0;
        settings
    }

    fn patients() -> ResourceCatalog {
        ResourceCatalog::new(vec![Arc::new(
            DeclaredResource::builder("Patient")
                .upstream("patients")
                .field("gender", "sex")
                .build(),
        )])
        .unwrap()
    }

    #[test]
    fn topologies_split_the_topics() {
        assert_eq!(WorkerTopology::Resolver.topics(), [topics::RESOLVER]);
        assert_eq!(WorkerTopology::Refresh.topics(), topics::REFRESH_TOPICS);
        assert_eq!(WorkerTopology::All.topics().len(), 4);
        assert_eq!("refresh".parse::<WorkerTopology>().unwrap(), WorkerTopology::Refresh);
        assert!("both".parse::<WorkerTopology>().is_err());
    }

    #[tokio::test]
    async fn materialisation_triggers_one_resolver_job() {
        let (worker, store, jobs) = worker(patients(), immediate());
        store.insert_upstream("patients", "p-1", json!({"sex": "female"})).await;
        store.insert_upstream("patients", "p-2", json!({"sex": "male"})).await;
        for id in ["p-1", "p-2"] {
            jobs.submit_payload(&JobPayload::from_upstream("Patient", id), SubmitOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(worker.process_queue(topics::FROM_UPSTREAM).await.unwrap(), 2);
        assert_eq!(store.resources("patients").await.len(), 2);
        assert_eq!(jobs.count_queue(Some(topics::RESOLVER)).await.unwrap(), 1);

        assert_eq!(worker.process_queue(topics::RESOLVER).await.unwrap(), 1);
        assert_eq!(jobs.count_queue(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_resource_fails_the_job() {
        let (worker, _store, jobs) = worker(patients(), immediate());
        let job = jobs
            .submit_payload(&JobPayload::from_upstream("Observation", "o-1"), SubmitOptions::default())
            .await
            .unwrap()
            .unwrap();

        worker.process_queue(topics::FROM_UPSTREAM).await.unwrap();

        let failed = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("Observation"));
    }

    #[tokio::test]
    async fn read_only_resource_is_not_materialised() {
        let catalog = ResourceCatalog::new(vec![Arc::new(
            DeclaredResource::builder("Location")
                .upstream("locations")
                .capabilities(CapabilitySet::of(&[Capability::Read]))
                .build(),
        )])
        .unwrap();
        let (worker, store, jobs) = worker(catalog, immediate());
        store.insert_upstream("locations", "l-1", json!({})).await;
        let job = jobs
            .submit_payload(&JobPayload::from_upstream("Location", "l-1"), SubmitOptions::default())
            .await
            .unwrap()
            .unwrap();

        worker.process_queue(topics::FROM_UPSTREAM).await.unwrap();

        assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(store.resources("locations").await.is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_job() {
        let (worker, _store, jobs) = worker(patients(), immediate());
        let job = jobs
            .submit(topics::ENTIRE_RESOURCE, json!({"name": "Patient"}), SubmitOptions::default())
            .await
            .unwrap()
            .unwrap();

        worker.process_queue(topics::ENTIRE_RESOURCE).await.unwrap();

        let failed = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains(topics::ENTIRE_RESOURCE));
    }

    #[tokio::test]
    async fn upstream_fan_out_reaches_every_resource_of_the_table() {
        let catalog = ResourceCatalog::new(vec![
            Arc::new(DeclaredResource::builder("Patient").upstream("people").build()),
            Arc::new(DeclaredResource::builder("RelatedPerson").upstream("people").build()),
        ])
        .unwrap();
        let (worker, _store, jobs) = worker(catalog, immediate());
        jobs.submit_payload(&JobPayload::all_from_upstream("people", "x-1"), SubmitOptions::default())
            .await
            .unwrap();

        worker.process_queue(topics::ALL_FROM_UPSTREAM).await.unwrap();

        assert_eq!(jobs.count_queue(Some(topics::FROM_UPSTREAM)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn configured_retry_policy_requeues_failures() {
        let mut settings = immediate();
        settings.retry.insert(
            topics::FROM_UPSTREAM.to_string(),
            crate::config::RetrySettings {
                max_attempts: 2,
                base_delay_ms: 0,
                max_delay_ms: 0,
                strategy: crate::jobs::BackoffStrategy::Fixed,
            },
        );
        let (worker, _store, jobs) = worker(patients(), settings);
        let job = jobs
            .submit_payload(&JobPayload::from_upstream("Patient", "missing"), SubmitOptions::default())
            .await
            .unwrap()
            .unwrap();

        worker.process_queue(topics::FROM_UPSTREAM).await.unwrap();
        let retried = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn stopping_cancels_the_resolver_delay() {
        let mut settings = FhirSettings::default();
        settings.resolver.delay_ms = 60_000;
        let (worker, _store, jobs) = worker(patients(), settings);
        let job = jobs
            .submit_payload(
                &JobPayload::Resolver,
                SubmitOptions::default().discriminant(RESOLVER_DISCRIMINANT),
            )
            .await
            .unwrap()
            .unwrap();

        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should not wait for the resolver delay");

        let requeued = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
    }
}
