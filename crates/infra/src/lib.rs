//! Infrastructure for the FHIR materialisation pipeline: job queue, worker,
//! resource stores, dependency resolver, reconciler and refresh.

pub mod config;
pub mod context;
pub mod handlers;
pub mod jobs;
pub mod reconciler;
pub mod refresh;
pub mod resolver;
pub mod resources;
pub mod schema;


pub use config::{ConfigError, FhirSettings};
pub use context::FhirContext;
pub use handlers::{WorkerTopology, register_fhir_handlers};
pub use reconciler::{MissingReport, MissingResourceReconciler};
pub use refresh::{RefreshError, refresh_all_from_upstream, refresh_entire_resource};
pub use resolver::{DependencyResolver, ResolverError, ResolverPass, sort_by_dependency};
pub use schema::apply_schema;
