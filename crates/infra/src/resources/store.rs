//! Storage seams for upstream rows, materialised resources and backfill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use fhirmat_core::{ExpectedVersion, ResourceId, UpstreamId, VersionId};

use super::definition::{ResourceDefinition, UpstreamIdType, UpstreamModel};
use super::predicate::{Predicate, PredicateError};

/// One row of an upstream table, as JSON keyed by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRow {
    pub table: String,
    pub id: UpstreamId,
    pub data: JsonValue,
}

impl UpstreamRow {
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.data.get(column).filter(|v| !v.is_null())
    }

    /// `column` read as an upstream id.
    pub fn upstream_id(&self, column: &str) -> Option<UpstreamId> {
        id_from_json(self.get(column)?)
    }
}

/// A JSON scalar read as an upstream id. `null` is no id.
pub fn id_from_json(value: &JsonValue) -> Option<UpstreamId> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(UpstreamId::new(s.as_str())),
        other => Some(UpstreamId::new(other.to_string())),
    }
}

/// A materialised FHIR resource row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialisedResource {
    pub id: ResourceId,
    pub upstream_id: UpstreamId,
    pub resource_table: String,
    pub version_id: VersionId,
    pub data: JsonValue,
    pub last_updated: DateTime<Utc>,
    pub is_live: bool,
    /// Every reference in `data` points at a materialised resource.
    pub resolved: bool,
}

impl MaterialisedResource {
    /// Render as a FHIR resource of type `fhir_name`.
    pub fn as_fhir(&self, fhir_name: &str) -> JsonValue {
        let mut out = Map::new();
        out.insert("resourceType".into(), json!(fhir_name));
        out.insert("id".into(), json!(self.id));
        out.insert(
            "meta".into(),
            json!({
                "versionId": self.version_id.to_string(),
                "lastUpdated": self.last_updated.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            }),
        );
        if let JsonValue::Object(fields) = &self.data {
            for (k, v) in fields {
                if !matches!(k.as_str(), "resourceType" | "id" | "meta") {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        JsonValue::Object(out)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency: the row moved on since it was read.
    #[error("stale write to {resource_table} for upstream {upstream_id} (expected {expected:?})")]
    StaleWrite {
        resource_table: String,
        upstream_id: UpstreamId,
        expected: ExpectedVersion,
    },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error(transparent)]
    Predicate(#[from] PredicateError),
    #[error("failed to decode row: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_stale_write(&self) -> bool {
        matches!(self, StoreError::StaleWrite { .. })
    }
}

/// Opens transactions over upstream and resource tables.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ResourceTx>, StoreError>;

    /// Read a materialised row outside any transaction.
    async fn get_resource(
        &self,
        resource_table: &str,
        upstream_id: &UpstreamId,
    ) -> Result<Option<MaterialisedResource>, StoreError>;
}

/// One transaction. Dropping it without `commit` discards its writes.
#[async_trait::async_trait]
pub trait ResourceTx: Send {
    async fn load_upstream(
        &mut self,
        upstream: &UpstreamModel,
        id: &UpstreamId,
    ) -> Result<Option<UpstreamRow>, StoreError>;

    /// Ids of the rows of `table` whose `column` equals `value`.
    async fn find_upstream_ids(
        &mut self,
        table: &str,
        column: &str,
        column_type: UpstreamIdType,
        value: &UpstreamId,
    ) -> Result<Vec<UpstreamId>, StoreError>;

    async fn find_by_upstream(
        &mut self,
        resource_table: &str,
        upstream_id: &UpstreamId,
    ) -> Result<Option<MaterialisedResource>, StoreError>;

    /// Insert or update keyed by upstream id. Rejected with
    /// [`StoreError::StaleWrite`] unless the stored version matches `expected`.
    async fn write_resource(
        &mut self,
        resource: &MaterialisedResource,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Upstream ids of live rows that still hold unresolved references.
    async fn unresolved_upstream_ids(
        &mut self,
        resource_table: &str,
    ) -> Result<Vec<UpstreamId>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Which upstream rows a backfill enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillScope {
    /// In-scope rows with no materialised resource yet.
    Missing,
    /// Every row, ignoring the eligibility filter.
    All,
}

/// One (resource, upstream table) pair to count or backfill.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillTarget {
    pub resource: String,
    pub resource_table: String,
    pub upstream_table: String,
    pub upstream_id_type: UpstreamIdType,
    pub filter: Option<Predicate>,
}

impl BackfillTarget {
    pub fn new<D: ResourceDefinition + ?Sized>(def: &D, upstream: &UpstreamModel) -> Self {
        Self {
            resource: def.fhir_name().to_string(),
            resource_table: def.resource_table().to_string(),
            upstream_table: upstream.table.clone(),
            upstream_id_type: upstream.id_type,
            filter: def.filter_upstream(&upstream.table),
        }
    }
}

/// Set-based queries over upstream tables. Ids are never loaded into memory.
#[async_trait::async_trait]
pub trait BackfillStore: Send + Sync {
    /// In-scope upstream rows with no materialised resource.
    async fn count_missing(&self, target: &BackfillTarget) -> Result<u64, StoreError>;

    /// Enqueue one `fromUpstream` job per selected row in a single statement.
    async fn enqueue_upstream(
        &self,
        target: &BackfillTarget,
        scope: BackfillScope,
    ) -> Result<u64, StoreError>;
}
