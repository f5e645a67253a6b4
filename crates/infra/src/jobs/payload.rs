//! Topic names and their strongly-typed payloads.
//!
//! Each FHIR topic owns one payload schema. Payloads travel through the store
//! as JSON and are decoded when a worker claims the job, based on the topic.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use fhirmat_core::UpstreamId;

/// Topic names routed by the FHIR worker.
pub mod topics {
    /// Materialise a single resource from one upstream row.
    pub const FROM_UPSTREAM: &str = "fhir.refresh.fromUpstream";
    /// Fan one upstream write out to every resource built from that table.
    pub const ALL_FROM_UPSTREAM: &str = "fhir.refresh.allFromUpstream";
    /// Re-materialise every upstream row of one resource.
    pub const ENTIRE_RESOURCE: &str = "fhir.refresh.entireResource";
    /// Dependency-ordered reference resolution of every resource.
    pub const RESOLVER: &str = "fhir.resolver";

    pub const RESOLVER_TOPICS: &[&str] = &[RESOLVER];
    pub const REFRESH_TOPICS: &[&str] = &[FROM_UPSTREAM, ALL_FROM_UPSTREAM, ENTIRE_RESOURCE];
}

/// Fixed discriminant for resolver jobs: bursts collapse into one pending job.
pub const RESOLVER_DISCRIMINANT: &str = "one at a time";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromUpstream {
    pub resource: String,
    pub upstream_id: UpstreamId,
}

/// Kind of write an upstream change notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpstreamOp {
    Insert,
    Update,
    Delete,
}

/// A write to row `id` of `table`, which may or may not be an upstream table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllFromUpstream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<UpstreamOp>,
    pub table: String,
    pub id: UpstreamId,
    /// Last content of the row, for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_row: Option<JsonValue>,
}

impl AllFromUpstream {
    pub fn new(table: impl Into<String>, id: impl Into<UpstreamId>) -> Self {
        Self {
            op: None,
            table: table.into(),
            id: id.into(),
            deleted_row: None,
        }
    }

    pub fn op(mut self, op: UpstreamOp) -> Self {
        self.op = Some(op);
        self
    }

    /// A delete, carrying the row as it was.
    pub fn deleted(mut self, row: JsonValue) -> Self {
        self.op = Some(UpstreamOp::Delete);
        self.deleted_row = Some(row);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntireResource {
    pub resource: String,
}

/// Decoded job payload, one variant per FHIR topic.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    FromUpstream(FromUpstream),
    AllFromUpstream(AllFromUpstream),
    EntireResource(EntireResource),
    Resolver,
    /// A topic outside the FHIR set; the payload is left to its handler.
    Other { topic: String, payload: JsonValue },
}

#[derive(Debug, Error)]
#[error("invalid payload for topic {topic}: {source}")]
pub struct PayloadError {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}

impl JobPayload {
    pub fn from_upstream(resource: impl Into<String>, upstream_id: impl Into<UpstreamId>) -> Self {
        Self::FromUpstream(FromUpstream {
            resource: resource.into(),
            upstream_id: upstream_id.into(),
        })
    }

    pub fn all_from_upstream(table: impl Into<String>, id: impl Into<UpstreamId>) -> Self {
        Self::AllFromUpstream(AllFromUpstream::new(table, id))
    }

    pub fn entire_resource(resource: impl Into<String>) -> Self {
        Self::EntireResource(EntireResource {
            resource: resource.into(),
        })
    }

    pub fn topic(&self) -> &str {
        match self {
            JobPayload::FromUpstream(_) => topics::FROM_UPSTREAM,
            JobPayload::AllFromUpstream(_) => topics::ALL_FROM_UPSTREAM,
            JobPayload::EntireResource(_) => topics::ENTIRE_RESOURCE,
            JobPayload::Resolver => topics::RESOLVER,
            JobPayload::Other { topic, .. } => topic,
        }
    }

    pub fn to_value(&self) -> JsonValue {
        let encoded = match self {
            JobPayload::FromUpstream(p) => serde_json::to_value(p),
            JobPayload::AllFromUpstream(p) => serde_json::to_value(p),
            JobPayload::EntireResource(p) => serde_json::to_value(p),
            JobPayload::Resolver => Ok(JsonValue::Object(Default::default())),
            JobPayload::Other { payload, .. } => Ok(payload.clone()),
        };
        // The payload structs only hold strings, which always serialize.
        encoded.unwrap_or(JsonValue::Null)
    }

    pub fn decode(topic: &str, payload: &JsonValue) -> Result<Self, PayloadError> {
        let err = |source| PayloadError {
            topic: topic.to_string(),
            source,
        };

        match topic {
            topics::FROM_UPSTREAM => serde_json::from_value(payload.clone())
                .map(JobPayload::FromUpstream)
                .map_err(err),
            topics::ALL_FROM_UPSTREAM => serde_json::from_value(payload.clone())
                .map(JobPayload::AllFromUpstream)
                .map_err(err),
            topics::ENTIRE_RESOURCE => serde_json::from_value(payload.clone())
                .map(JobPayload::EntireResource)
                .map_err(err),
            topics::RESOLVER => Ok(JobPayload::Resolver),
            other => Ok(JobPayload::Other {
                topic: other.to_string(),
                payload: payload.clone(),
            }),
        }
    }
}
