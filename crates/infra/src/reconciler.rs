//! Missing-resource reconciler.
//!
//! Diffs every (materialisable resource, upstream table) pair and backfills
//! the gaps. Counting and enqueueing are both single set-based statements, so
//! the size of an upstream table never reaches process memory. Running again
//! before workers drain a previous pass only re-enqueues rows that are still
//! missing; materialisation is idempotent, so duplicates are harmless.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fhirmat_core::Capability;

use crate::context::FhirContext;
use crate::resources::{BackfillScope, BackfillTarget, StoreError};

/// Gap for one (resource, upstream) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingCount {
    pub resource: String,
    pub upstream: String,
    pub missing: u64,
}

/// Result of [`MissingResourceReconciler::count_queue`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MissingReport {
    pub counts: Vec<MissingCount>,
    pub total: u64,
}

impl MissingReport {
    pub fn missing_for(&self, resource: &str, upstream: &str) -> Option<u64> {
        self.counts
            .iter()
            .find(|c| c.resource == resource && c.upstream == upstream)
            .map(|c| c.missing)
    }
}

pub struct MissingResourceReconciler {
    ctx: Arc<FhirContext>,
}

impl MissingResourceReconciler {
    pub fn new(ctx: Arc<FhirContext>) -> Self {
        Self { ctx }
    }

    fn targets(&self) -> Vec<BackfillTarget> {
        self.ctx
            .catalog
            .resources_that_can_do(Capability::Materialise)
            .iter()
            .flat_map(|def| {
                def.upstream_models()
                    .iter()
                    .map(|upstream| BackfillTarget::new(def.as_ref(), upstream))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Count missing resources per pair, logging each gap and the total.
    pub async fn count_queue(&self) -> Result<MissingReport, StoreError> {
        let mut report = MissingReport::default();
        for target in self.targets() {
            let missing = self.ctx.backfill.count_missing(&target).await?;
            if missing > 0 {
                info!(
                    resource = %target.resource,
                    upstream = %target.upstream_table,
                    total = missing,
                    "missing resources"
                );
            }
            report.total += missing;
            report.counts.push(MissingCount {
                resource: target.resource,
                upstream: target.upstream_table,
                missing,
            });
        }

        info!(total = report.total, "missing resources total");
        Ok(report)
    }

    /// Enqueue one materialisation job per missing row. Returns the report the
    /// backfill was based on and how many jobs were enqueued.
    pub async fn run(&self) -> Result<(MissingReport, u64), StoreError> {
        let report = self.count_queue().await?;
        let mut enqueued = 0;

        for target in self.targets() {
            if report.missing_for(&target.resource, &target.upstream_table) == Some(0) {
                continue;
            }
            let n = self
                .ctx
                .backfill
                .enqueue_upstream(&target, BackfillScope::Missing)
                .await?;
            info!(
                resource = %target.resource,
                upstream = %target.upstream_table,
                total = n,
                "enqueued missing resources"
            );
            enqueued += n;
        }

        Ok((report, enqueued))
    }

    /// Run every `interval` until `shutdown` flips. Failures are logged and
    /// the next cycle tries again.
    pub async fn run_scheduled(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.run().await {
                Ok((_, 0)) => {}
                Ok((report, enqueued)) => {
                    warn!(total = report.total, enqueued, "reconciler backfilled missing resources")
                }
                Err(e) => error!(error = %e, "reconciler pass failed; retrying next cycle"),
            }
        }

        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FhirSettings;
    use crate::jobs::{JobStore, topics};
    use crate::resources::{DeclaredResource, InMemoryFhirStore, ResourceCatalog};
    use serde_json::json;

    fn context(store: &InMemoryFhirStore) -> Arc<FhirContext> {
        let catalog = ResourceCatalog::new(vec![
            Arc::new(DeclaredResource::builder("Patient").upstream("patients").build()),
            Arc::new(
                DeclaredResource::builder("Location")
                    .upstream("sites")
                    .upstream("wards")
                    .build(),
            ),
        ])
        .unwrap();
        Arc::new(FhirContext::in_memory(catalog, store, FhirSettings::default()))
    }

    #[tokio::test]
    async fn reports_every_resource_upstream_pair() {
        let store = InMemoryFhirStore::new();
        store.insert_upstream("wards", "w-1", json!({})).await;
        store.insert_upstream("wards", "w-2", json!({})).await;

        let report = MissingResourceReconciler::new(context(&store)).count_queue().await.unwrap();

        assert_eq!(report.counts.len(), 3);
        assert_eq!(report.missing_for("Patient", "patients"), Some(0));
        assert_eq!(report.missing_for("Location", "sites"), Some(0));
        assert_eq!(report.missing_for("Location", "wards"), Some(2));
        assert_eq!(report.total, 2);
    }

    #[tokio::test]
    async fn empty_gaps_issue_no_statements() {
        let store = InMemoryFhirStore::new();
        let (_, enqueued) = MissingResourceReconciler::new(context(&store)).run().await.unwrap();
        assert_eq!(enqueued, 0);
        assert_eq!(store.jobs().bulk_insert_calls(), 0);
    }

    #[tokio::test]
    async fn scheduled_loop_runs_then_stops_on_shutdown() {
        let store = InMemoryFhirStore::new();
        store.insert_upstream("patients", "p-1", json!({})).await;
        let reconciler = MissingResourceReconciler::new(context(&store));
        let (stop, stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            reconciler.run_scheduled(Duration::from_secs(3600), stopped).await
        });
        let jobs = store.jobs();
        for _ in 0..100 {
            if jobs.count_queue(Some(topics::FROM_UPSTREAM)).await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(jobs.count_queue(Some(topics::FROM_UPSTREAM)).await.unwrap(), 1);
    }
}
