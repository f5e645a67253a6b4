//! Shared context handed to handlers, the resolver and the reconciler.

use std::fmt;
use std::sync::Arc;

use sqlx::PgPool;

use crate::config::FhirSettings;
use crate::jobs::{JobStore, PostgresJobStore};
use crate::resources::{
    BackfillStore, InMemoryFhirStore, PostgresBackfillStore, PostgresResourceStore,
    ResourceCatalog, ResourceStore,
};

/// The resource catalogue, the stores and the settings for one process.
///
/// Built once at startup and shared behind an `Arc`; nothing in it changes
/// after construction.
#[derive(Clone)]
pub struct FhirContext {
    pub catalog: ResourceCatalog,
    pub jobs: Arc<dyn JobStore>,
    pub resources: Arc<dyn ResourceStore>,
    pub backfill: Arc<dyn BackfillStore>,
    pub settings: FhirSettings,
}

impl FhirContext {
    pub fn new(
        catalog: ResourceCatalog,
        jobs: Arc<dyn JobStore>,
        resources: Arc<dyn ResourceStore>,
        backfill: Arc<dyn BackfillStore>,
        settings: FhirSettings,
    ) -> Self {
        Self {
            catalog,
            jobs,
            resources,
            backfill,
            settings,
        }
    }

    /// Postgres-backed stores sharing one pool.
    pub fn postgres(pool: PgPool, catalog: ResourceCatalog, settings: FhirSettings) -> Self {
        let jobs = Arc::new(PostgresJobStore::new(pool.clone(), settings.worker.retention));
        let resources = Arc::new(PostgresResourceStore::new(pool.clone()));
        let backfill = Arc::new(PostgresBackfillStore::new(pool));
        Self::new(catalog, jobs, resources, backfill, settings)
    }

    /// In-memory stores: `store` serves resources and backfills, its job
    /// queue serves the jobs.
    pub fn in_memory(
        catalog: ResourceCatalog,
        store: &InMemoryFhirStore,
        settings: FhirSettings,
    ) -> Self {
        let shared = Arc::new(store.clone());
        Self::new(catalog, store.jobs(), shared.clone(), shared, settings)
    }
}

impl fmt::Debug for FhirContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FhirContext")
            .field("catalog", &self.catalog)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
