//! Resource registry and the materialisation contract.

pub mod catalog;
pub mod declared;
pub mod definition;
pub mod in_memory;
pub mod materialise;
pub mod postgres;
pub mod predicate;
pub mod store;

pub use catalog::{CatalogError, ResourceCatalog};
pub use declared::{DeclaredReference, DeclaredResource, DeclaredResourceSpec};
pub use definition::{
    ResourceDefinition, UpstreamIdType, UpstreamLookup, UpstreamModel, default_resource_table,
};
pub use in_memory::InMemoryFhirStore;
pub use materialise::{
    MAX_STALE_WRITE_ATTEMPTS, MaterialiseError, MaterialiseScope, Materialised, ResolveSummary,
    UPSTREAM_REFERENCE_PREFIX, materialise_from_upstream, materialise_in, rematerialise_unresolved,
};
pub use postgres::{PostgresBackfillStore, PostgresResourceStore};
pub use predicate::{Predicate, PredicateError, SqlParams, validate_identifier};
pub use store::{
    BackfillScope, BackfillStore, BackfillTarget, MaterialisedResource, ResourceStore, ResourceTx,
    StoreError, UpstreamRow, id_from_json,
};
