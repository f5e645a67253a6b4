//! Static catalogue of resource definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fhirmat_core::Capability;

use super::definition::ResourceDefinition;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("resource {0} is defined twice")]
    DuplicateResource(String),
    #[error("resource table {table} is used by both {first} and {second}")]
    DuplicateTable {
        table: String,
        first: String,
        second: String,
    },
}

/// Immutable set of definitions, built once and shared through the context.
#[derive(Clone, Default)]
pub struct ResourceCatalog {
    resources: Vec<Arc<dyn ResourceDefinition>>,
    by_name: HashMap<String, usize>,
}

impl ResourceCatalog {
    pub fn new(resources: Vec<Arc<dyn ResourceDefinition>>) -> Result<Self, CatalogError> {
        let mut by_name = HashMap::with_capacity(resources.len());
        let mut by_table: HashMap<&str, &str> = HashMap::with_capacity(resources.len());

        for (idx, def) in resources.iter().enumerate() {
            if by_name.insert(def.fhir_name().to_string(), idx).is_some() {
                return Err(CatalogError::DuplicateResource(def.fhir_name().to_string()));
            }
            if let Some(first) = by_table.insert(def.resource_table(), def.fhir_name()) {
                return Err(CatalogError::DuplicateTable {
                    table: def.resource_table().to_string(),
                    first: first.to_string(),
                    second: def.fhir_name().to_string(),
                });
            }
        }

        Ok(Self { resources, by_name })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, fhir_name: &str) -> Result<&Arc<dyn ResourceDefinition>, CatalogError> {
        self.by_name
            .get(fhir_name)
            .map(|idx| &self.resources[*idx])
            .ok_or_else(|| CatalogError::UnknownResource(fhir_name.to_string()))
    }

    /// Definitions declaring `capability`, in catalogue order.
    pub fn resources_that_can_do(&self, capability: Capability) -> Vec<Arc<dyn ResourceDefinition>> {
        self.resources
            .iter()
            .filter(|def| def.can_do(capability))
            .cloned()
            .collect()
    }

    /// Materialisable definitions built from `table`.
    pub fn with_upstream_table(&self, table: &str) -> Vec<Arc<dyn ResourceDefinition>> {
        self.resources
            .iter()
            .filter(|def| def.can_do(Capability::Materialise))
            .filter(|def| def.upstream_models().iter().any(|m| m.table == table))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ResourceDefinition>> {
        self.resources.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.resources.iter().map(|def| def.fhir_name()).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl fmt::Debug for ResourceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCatalog")
            .field("resources", &self.names())
            .finish()
    }
}
