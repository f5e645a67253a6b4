//! The contract every materialisable FHIR resource implements.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fhirmat_core::{Capability, CapabilitySet, UpstreamId};

use super::materialise::{MaterialiseError, MaterialiseScope, ResolveSummary, rematerialise_unresolved};
use super::predicate::Predicate;
use super::store::{MaterialisedResource, ResourceTx, UpstreamRow};
use crate::context::FhirContext;

/// Postgres type of an upstream table's `id` column.
///
/// Lookups cast the bound parameter to this type so the comparison stays on
/// the column's primary-key index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamIdType {
    #[default]
    Text,
    Uuid,
    Bigint,
}

impl UpstreamIdType {
    /// `$n`, cast to this type.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            UpstreamIdType::Text => format!("${n}"),
            UpstreamIdType::Uuid => format!("${n}::uuid"),
            UpstreamIdType::Bigint => format!("${n}::bigint"),
        }
    }

    /// `expr` as text, for comparing against a text column.
    pub fn as_text(self, expr: &str) -> String {
        match self {
            UpstreamIdType::Text => expr.to_string(),
            UpstreamIdType::Uuid | UpstreamIdType::Bigint => format!("{expr}::text"),
        }
    }
}

/// A source-of-truth table a resource is built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamModel {
    pub table: String,
    #[serde(default)]
    pub id_type: UpstreamIdType,
}

impl UpstreamModel {
    pub fn new(table: impl Into<String>) -> Self {
        Self::with_id_type(table, UpstreamIdType::default())
    }

    pub fn with_id_type(table: impl Into<String>, id_type: UpstreamIdType) -> Self {
        Self {
            table: table.into(),
            id_type,
        }
    }
}

/// How a change to a table a resource is not built from maps back onto rows
/// of one of its upstream tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamLookup {
    /// Upstream rows whose `column` (of type `column_type`) holds the changed
    /// row's id.
    Referencing {
        column: String,
        column_type: UpstreamIdType,
    },
    /// The upstream row named by `column` of the changed row. The changed row
    /// is read back by its id (of type `id_type`) unless it was deleted.
    ReferencedBy { column: String, id_type: UpstreamIdType },
    /// Upstream ids known up front.
    Ids(Vec<UpstreamId>),
}

/// A FHIR resource type the pipeline can materialise.
///
/// Definitions are immutable and built once at startup into a
/// [`ResourceCatalog`](super::ResourceCatalog).
#[async_trait::async_trait]
pub trait ResourceDefinition: Send + Sync {
    /// Name in FHIR, e.g. `Patient`.
    fn fhir_name(&self) -> &str;

    /// Table holding materialised rows, see [`default_resource_table`].
    fn resource_table(&self) -> &str;

    /// Tables the upstream row is looked up in, first match wins.
    fn upstream_models(&self) -> &[UpstreamModel];

    /// FHIR names of resources this one references. These are resolved first.
    fn referenced_resources(&self) -> &[String];

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::materialised()
    }

    fn can_do(&self, capability: Capability) -> bool {
        self.capabilities().contains(capability)
    }

    /// Which rows of `upstream_table` are in scope. `None` means all of them.
    fn filter_upstream(&self, _upstream_table: &str) -> Option<Predicate> {
        None
    }

    /// Rows of `upstream_table` affected by a change to row `id` of `table`,
    /// which is not one of this resource's upstream tables. `deleted_row` is
    /// the row's last content when the change was a delete.
    fn upstream_ids_from_table(
        &self,
        _upstream_table: &str,
        _table: &str,
        _id: &UpstreamId,
        _deleted_row: Option<&JsonValue>,
    ) -> Option<UpstreamLookup> {
        None
    }

    /// Whether `upstream` still represents a live record.
    fn upstream_is_live(&self, _upstream: &UpstreamRow) -> bool {
        true
    }

    /// A resolved resource that was not live and stays not live is left
    /// alone, unless this returns `true`.
    async fn should_force_rematerialise(
        &self,
        _existing: &MaterialisedResource,
        _upstream: &UpstreamRow,
        _scope: &mut MaterialiseScope<'_>,
    ) -> Result<bool, MaterialiseError> {
        Ok(false)
    }

    /// Turn an upstream row into the resource document, without
    /// `resourceType`, `id` or `meta`.
    ///
    /// References to other resources go through [`MaterialiseScope::reference`]
    /// so unresolved targets are tracked.
    async fn transform(
        &self,
        upstream: &UpstreamRow,
        scope: &mut MaterialiseScope<'_>,
    ) -> Result<JsonValue, MaterialiseError>;

    /// Other upstream ids of this resource to rematerialise after this one.
    ///
    /// Only followed one level deep: rows materialised because they are
    /// related do not cascade further.
    async fn related_upstream_ids(
        &self,
        _upstream: &UpstreamRow,
        _scope: &mut MaterialiseScope<'_>,
    ) -> Result<Vec<UpstreamId>, MaterialiseError> {
        Ok(Vec::new())
    }

    /// Fix up references once their targets exist. Runs inside the resolver's
    /// transaction.
    async fn resolve_upstreams(
        &self,
        tx: &mut dyn ResourceTx,
        ctx: &FhirContext,
    ) -> Result<ResolveSummary, MaterialiseError> {
        rematerialise_unresolved(self, tx, ctx).await
    }
}

/// `ServiceRequest` → `service_requests`.
pub fn default_resource_table(fhir_name: &str) -> String {
    let mut table = String::with_capacity(fhir_name.len() + 4);
    for (i, c) in fhir_name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                table.push('_');
            }
            table.push(c.to_ascii_lowercase());
        } else {
            table.push(c);
        }
    }

    if table.ends_with('s') || table.ends_with('x') || table.ends_with("ch") || table.ends_with("sh") {
        table.push_str("es");
    } else if let Some(stem) = table
        .strip_suffix('y')
        .filter(|stem| !stem.ends_with(['a', 'e', 'i', 'o', 'u']))
    {
        table = format!("{stem}ies");
    } else {
        table.push('s');
    }
    table
}
