//! `fhirmat-core`: foundation types for the FHIR materialisation pipeline.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns).

pub mod capability;
pub mod error;
pub mod id;
pub mod version;

pub use capability::{Capability, CapabilitySet};
pub use error::{DomainError, DomainResult};
pub use id::{ResourceId, UpstreamId, WorkerId};
pub use version::{ExpectedVersion, VersionId};
