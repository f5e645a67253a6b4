//! In-memory upstream/resource store for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};

use fhirmat_core::{ExpectedVersion, UpstreamId};

use super::definition::{UpstreamIdType, UpstreamModel};
use super::predicate::Predicate;
use super::store::{
    BackfillScope, BackfillStore, BackfillTarget, MaterialisedResource, ResourceStore, ResourceTx,
    StoreError, UpstreamRow,
};
use crate::jobs::{InMemoryJobStore, Job, JobPayload, JobPriority, JobRetention, SubmitOptions};

#[derive(Debug, Default, Clone)]
struct State {
    /// table → id → row
    upstream: HashMap<String, BTreeMap<UpstreamId, JsonValue>>,
    /// resource table → upstream id → resource
    resources: HashMap<String, BTreeMap<UpstreamId, MaterialisedResource>>,
}

impl State {
    fn resource(&self, table: &str, upstream_id: &UpstreamId) -> Option<&MaterialisedResource> {
        self.resources.get(table).and_then(|rows| rows.get(upstream_id))
    }

    fn selected_ids(&self, target: &BackfillTarget, scope: BackfillScope) -> Vec<UpstreamId> {
        let Some(rows) = self.upstream.get(&target.upstream_table) else {
            return Vec::new();
        };
        rows.iter()
            .filter(|(id, row)| match scope {
                BackfillScope::All => true,
                BackfillScope::Missing => {
                    target.filter.as_ref().is_none_or(|f| f.matches(row))
                        && self.resource(&target.resource_table, id).is_none()
                }
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Upstream tables, resource tables and the job queue, all in process memory.
///
/// A transaction holds the store lock until it commits or is dropped, so
/// transactions never interleave.
#[derive(Debug, Clone)]
pub struct InMemoryFhirStore {
    state: Arc<Mutex<State>>,
    jobs: Arc<InMemoryJobStore>,
    inject_stale_writes: Arc<AtomicU32>,
}

impl InMemoryFhirStore {
    pub fn new() -> Self {
        Self::with_retention(JobRetention::default())
    }

    pub fn with_retention(retention: JobRetention) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            jobs: Arc::new(InMemoryJobStore::with_retention(retention)),
            inject_stale_writes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The job queue backfills are written to.
    pub fn jobs(&self) -> Arc<InMemoryJobStore> {
        self.jobs.clone()
    }

    /// Insert or replace an upstream row. `id` is copied into the row data.
    pub async fn insert_upstream(&self, table: &str, id: impl Into<UpstreamId>, mut data: JsonValue) {
        let id = id.into();
        if let JsonValue::Object(fields) = &mut data {
            fields.insert("id".into(), JsonValue::String(id.to_string()));
        }
        let mut state = self.state.lock().await;
        state
            .upstream
            .entry(table.to_string())
            .or_default()
            .insert(id, data);
    }

    pub async fn delete_upstream(&self, table: &str, id: &UpstreamId) -> bool {
        let mut state = self.state.lock().await;
        state
            .upstream
            .get_mut(table)
            .is_some_and(|rows| rows.remove(id).is_some())
    }

    /// Every resource in `resource_table`, ordered by upstream id.
    pub async fn resources(&self, resource_table: &str) -> Vec<MaterialisedResource> {
        let state = self.state.lock().await;
        state
            .resources
            .get(resource_table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `n` resource writes fail as if another writer won.
    pub fn inject_stale_writes(&self, n: u32) {
        self.inject_stale_writes.store(n, Ordering::SeqCst);
    }
}

impl Default for InMemoryFhirStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceStore for InMemoryFhirStore {
    async fn begin(&self) -> Result<Box<dyn ResourceTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            working,
            inject_stale_writes: self.inject_stale_writes.clone(),
        }))
    }

    async fn get_resource(
        &self,
        resource_table: &str,
        upstream_id: &UpstreamId,
    ) -> Result<Option<MaterialisedResource>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.resource(resource_table, upstream_id).cloned())
    }
}

struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    inject_stale_writes: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl ResourceTx for InMemoryTx {
    async fn load_upstream(
        &mut self,
        upstream: &UpstreamModel,
        id: &UpstreamId,
    ) -> Result<Option<UpstreamRow>, StoreError> {
        Ok(self
            .working
            .upstream
            .get(&upstream.table)
            .and_then(|rows| rows.get(id))
            .map(|data| UpstreamRow {
                table: upstream.table.clone(),
                id: id.clone(),
                data: data.clone(),
            }))
    }

    async fn find_upstream_ids(
        &mut self,
        table: &str,
        column: &str,
        _column_type: UpstreamIdType,
        value: &UpstreamId,
    ) -> Result<Vec<UpstreamId>, StoreError> {
        let wanted = Predicate::eq(column, value.as_str());
        Ok(self
            .working
            .upstream
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| wanted.matches(row))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_upstream(
        &mut self,
        resource_table: &str,
        upstream_id: &UpstreamId,
    ) -> Result<Option<MaterialisedResource>, StoreError> {
        Ok(self.working.resource(resource_table, upstream_id).cloned())
    }

    async fn write_resource(
        &mut self,
        resource: &MaterialisedResource,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let stale = || StoreError::StaleWrite {
            resource_table: resource.resource_table.clone(),
            upstream_id: resource.upstream_id.clone(),
            expected,
        };

        let injected = self
            .inject_stale_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(stale());
        }

        let current = self
            .working
            .resource(&resource.resource_table, &resource.upstream_id)
            .map(|r| r.version_id);
        if !expected.matches(current) {
            return Err(stale());
        }

        self.working
            .resources
            .entry(resource.resource_table.clone())
            .or_default()
            .insert(resource.upstream_id.clone(), resource.clone());
        Ok(())
    }

    async fn unresolved_upstream_ids(
        &mut self,
        resource_table: &str,
    ) -> Result<Vec<UpstreamId>, StoreError> {
        Ok(self
            .working
            .resources
            .get(resource_table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.is_live && !r.resolved)
                    .map(|r| r.upstream_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackfillStore for InMemoryFhirStore {
    async fn count_missing(&self, target: &BackfillTarget) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.selected_ids(target, BackfillScope::Missing).len() as u64)
    }

    async fn enqueue_upstream(
        &self,
        target: &BackfillTarget,
        scope: BackfillScope,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        let options = SubmitOptions::default().priority(JobPriority::LOW);
        let batch = state
            .selected_ids(target, scope)
            .into_iter()
            .map(|id| {
                let payload = JobPayload::from_upstream(target.resource.as_str(), id);
                Job::new(payload.topic(), payload.to_value(), options.clone())
            })
            .collect();

        self.jobs
            .insert_bulk(batch)
            .map_err(|e| StoreError::Storage(e.to_string()))
    }
}
