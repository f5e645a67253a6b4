//! Resources declared in configuration instead of code.
//!
//! A declared resource copies upstream columns into document fields and turns
//! foreign-key columns into references:
//!
//! ```toml
//! [[resources]]
//! name = "Encounter"
//! upstreams = ["encounters"]
//! upstream_id_type = "uuid"
//! fields = { status = "status", period_start = "start_date" }
//! references = [{ field = "subject", column = "patient_id", resource = "Patient" }]
//! filter = { op = "is_null", column = "deleted_at" }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use fhirmat_core::{CapabilitySet, DomainError, DomainResult};

use super::definition::{ResourceDefinition, UpstreamIdType, UpstreamModel, default_resource_table};
use super::materialise::{MaterialiseError, MaterialiseScope};
use super::predicate::{Predicate, SqlParams, validate_identifier};
use super::store::UpstreamRow;

/// A foreign-key column rendered as a FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredReference {
    pub field: String,
    pub column: String,
    pub resource: String,
}

/// Serialised form of a declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclaredResourceSpec {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    pub upstreams: Vec<String>,
    /// Type of the `id` column of every upstream table.
    #[serde(default)]
    pub upstream_id_type: UpstreamIdType,
    /// Document field → upstream column.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub references: Vec<DeclaredReference>,
    /// Eligibility filter, applied to every upstream table.
    #[serde(default)]
    pub filter: Option<Predicate>,
    /// Rows not matching this are materialised with `isLive = false`.
    #[serde(default)]
    pub live_when: Option<Predicate>,
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
}

#[derive(Debug, Clone)]
pub struct DeclaredResource {
    name: String,
    table: String,
    upstreams: Vec<UpstreamModel>,
    fields: BTreeMap<String, String>,
    references: Vec<DeclaredReference>,
    referenced: Vec<String>,
    filter: Option<Predicate>,
    live_when: Option<Predicate>,
    capabilities: CapabilitySet,
}

impl DeclaredResource {
    pub fn builder(name: impl Into<String>) -> DeclaredResourceBuilder {
        let name = name.into();
        DeclaredResourceBuilder {
            spec: DeclaredResourceSpec {
                name,
                table: None,
                upstreams: Vec::new(),
                upstream_id_type: UpstreamIdType::default(),
                fields: BTreeMap::new(),
                references: Vec::new(),
                filter: None,
                live_when: None,
                capabilities: None,
            },
        }
    }

    pub fn from_spec(spec: DeclaredResourceSpec) -> DomainResult<Self> {
        validate_identifier(&spec.name)
            .map_err(|_| DomainError::validation(format!("invalid resource name {:?}", spec.name)))?;
        if spec.upstreams.is_empty() {
            return Err(DomainError::validation(format!(
                "resource {} has no upstream tables",
                spec.name
            )));
        }

        let table = spec
            .table
            .clone()
            .unwrap_or_else(|| default_resource_table(&spec.name));
        let columns = spec
            .upstreams
            .iter()
            .chain(std::iter::once(&table))
            .chain(spec.fields.values())
            .chain(spec.references.iter().map(|r| &r.column));
        for column in columns {
            validate_identifier(column).map_err(|e| {
                DomainError::validation(format!("resource {}: {e}", spec.name))
            })?;
        }
        for predicate in spec.filter.iter().chain(spec.live_when.iter()) {
            predicate
                .to_sql("upstream", &mut SqlParams::default())
                .map_err(|e| DomainError::validation(format!("resource {}: {e}", spec.name)))?;
        }

        let mut referenced: Vec<String> = spec.references.iter().map(|r| r.resource.clone()).collect();
        referenced.sort();
        referenced.dedup();

        Ok(Self {
            table,
            upstreams: spec
                .upstreams
                .into_iter()
                .map(|table| UpstreamModel::with_id_type(table, spec.upstream_id_type))
                .collect(),
            fields: spec.fields,
            references: spec.references,
            referenced,
            filter: spec.filter,
            live_when: spec.live_when,
            capabilities: spec.capabilities.unwrap_or_else(CapabilitySet::materialised),
            name: spec.name,
        })
    }
}

#[async_trait::async_trait]
impl ResourceDefinition for DeclaredResource {
    fn fhir_name(&self) -> &str {
        &self.name
    }

    fn resource_table(&self) -> &str {
        &self.table
    }

    fn upstream_models(&self) -> &[UpstreamModel] {
        &self.upstreams
    }

    fn referenced_resources(&self) -> &[String] {
        &self.referenced
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn filter_upstream(&self, upstream_table: &str) -> Option<Predicate> {
        self.upstreams
            .iter()
            .any(|m| m.table == upstream_table)
            .then(|| self.filter.clone())
            .flatten()
    }

    async fn transform(
        &self,
        upstream: &UpstreamRow,
        scope: &mut MaterialiseScope<'_>,
    ) -> Result<JsonValue, MaterialiseError> {
        let mut document = Map::new();

        for (field, column) in &self.fields {
            if let Some(value) = upstream.get(column) {
                document.insert(field.clone(), value.clone());
            }
        }

        for r in &self.references {
            let Some(target) = upstream.upstream_id(&r.column) else {
                continue;
            };
            let reference = scope.reference(&r.resource, &target).await?;
            document.insert(r.field.clone(), reference);
        }

        Ok(JsonValue::Object(document))
    }

    fn upstream_is_live(&self, upstream: &UpstreamRow) -> bool {
        self.live_when
            .as_ref()
            .is_none_or(|p| p.matches(&upstream.data))
    }
}

/// Fluent construction, mostly for tests and embedding.
#[derive(Debug, Clone)]
pub struct DeclaredResourceBuilder {
    spec: DeclaredResourceSpec,
}

impl DeclaredResourceBuilder {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.spec.table = Some(table.into());
        self
    }

    pub fn upstream(mut self, table: impl Into<String>) -> Self {
        self.spec.upstreams.push(table.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.spec.fields.insert(field.into(), column.into());
        self
    }

    pub fn reference(
        mut self,
        field: impl Into<String>,
        column: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        self.spec.references.push(DeclaredReference {
            field: field.into(),
            column: column.into(),
            resource: resource.into(),
        });
        self
    }

    pub fn upstream_id_type(mut self, id_type: UpstreamIdType) -> Self {
        self.spec.upstream_id_type = id_type;
        self
    }

    pub fn filter(mut self, filter: Predicate) -> Self {
        self.spec.filter = Some(filter);
        self
    }

    pub fn live_when(mut self, predicate: Predicate) -> Self {
        self.spec.live_when = Some(predicate);
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.spec.capabilities = Some(capabilities);
        self
    }

    pub fn try_build(self) -> DomainResult<DeclaredResource> {
        DeclaredResource::from_spec(self.spec)
    }

    /// Like [`try_build`](Self::try_build) for hand-written (test) definitions.
    ///
    /// # Panics
    ///
    /// Panics if the declaration is invalid.
    pub fn build(self) -> DeclaredResource {
        match self.try_build() {
            Ok(resource) => resource,
            Err(e) => panic!("invalid resource declaration: {e}"),
        }
    }
}
