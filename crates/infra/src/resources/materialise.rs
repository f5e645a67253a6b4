//! Upstream row → materialised resource.
//!
//! Writes are keyed by upstream id and version-stamped: the version read at
//! the start of a materialisation is the version the write expects. A write
//! that loses a race is rejected as stale and the whole materialisation is
//! redone on a fresh transaction.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use fhirmat_core::{ExpectedVersion, ResourceId, UpstreamId, VersionId};

use super::catalog::CatalogError;
use super::definition::{ResourceDefinition, UpstreamModel};
use super::store::{MaterialisedResource, ResourceStore, ResourceTx, StoreError, UpstreamRow};
use crate::config::FhirSettings;
use crate::context::FhirContext;

/// Attempts per materialisation before a stale write is reported.
pub const MAX_STALE_WRITE_ATTEMPTS: u32 = 3;

/// Prefix of the `type` of a reference whose target is not materialised yet.
pub const UPSTREAM_REFERENCE_PREFIX: &str = "upstream://";

#[derive(Debug, thiserror::Error)]
pub enum MaterialiseError {
    #[error("no upstream row {upstream_id} for {resource}")]
    UpstreamNotFound {
        resource: String,
        upstream_id: UpstreamId,
    },
    #[error("failed to transform {resource}: {message}")]
    Transform { resource: String, message: String },
    #[error("error resolving upstreams for {resource} (upstream {upstream_id}): {source}")]
    Resolve {
        resource: String,
        upstream_id: UpstreamId,
        #[source]
        source: Box<MaterialiseError>,
    },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MaterialiseError {
    pub fn transform(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Result of one materialisation.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialised {
    pub id: ResourceId,
    pub version_id: VersionId,
    /// `false` when the stored row already matched the upstream state.
    pub changed: bool,
    pub is_live: bool,
    pub resolved: bool,
    /// Related upstream ids the definition asked to rematerialise next.
    pub related: Vec<UpstreamId>,
}

impl From<&MaterialisedResource> for Materialised {
    fn from(r: &MaterialisedResource) -> Self {
        Self {
            id: r.id,
            version_id: r.version_id,
            changed: false,
            is_live: r.is_live,
            resolved: r.resolved,
            related: Vec::new(),
        }
    }
}

/// What one resource's resolve step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    /// Rows rematerialised.
    pub rows: usize,
    /// Rows that kept losing write races. They stay unresolved for a later pass.
    pub deferred: Vec<UpstreamId>,
}

/// What a definition's `transform` can reach.
pub struct MaterialiseScope<'a> {
    tx: &'a mut dyn ResourceTx,
    ctx: &'a FhirContext,
    unresolved: usize,
}

impl<'a> MaterialiseScope<'a> {
    pub fn new(tx: &'a mut dyn ResourceTx, ctx: &'a FhirContext) -> Self {
        Self {
            tx,
            ctx,
            unresolved: 0,
        }
    }

    pub fn settings(&self) -> &FhirSettings {
        &self.ctx.settings
    }

    /// Fetch a related upstream row (the "joins" of a materialisation).
    pub async fn load_upstream(
        &mut self,
        upstream: &UpstreamModel,
        id: &UpstreamId,
    ) -> Result<Option<UpstreamRow>, MaterialiseError> {
        Ok(self.tx.load_upstream(upstream, id).await?)
    }

    /// A FHIR reference to the `resource` built from `upstream_id`.
    ///
    /// When that resource is not materialised (or is tombstoned) the result is
    /// a placeholder `{"type": "upstream://<table>", "reference": "<id>"}` and
    /// the resource being built is marked unresolved.
    pub async fn reference(
        &mut self,
        resource: &str,
        upstream_id: &UpstreamId,
    ) -> Result<JsonValue, MaterialiseError> {
        let target = self.ctx.catalog.get(resource)?;
        let found = self
            .tx
            .find_by_upstream(target.resource_table(), upstream_id)
            .await?
            .filter(|r| r.is_live);

        Ok(match found {
            Some(r) => json!({
                "type": target.fhir_name(),
                "reference": format!("{}/{}", target.fhir_name(), r.id),
            }),
            None => {
                self.unresolved += 1;
                let table = target
                    .upstream_models()
                    .first()
                    .map(|m| m.table.as_str())
                    .unwrap_or(target.resource_table());
                json!({
                    "type": format!("{UPSTREAM_REFERENCE_PREFIX}{table}"),
                    "reference": upstream_id.as_str(),
                })
            }
        })
    }

    /// Placeholders handed out so far.
    pub fn unresolved(&self) -> usize {
        self.unresolved
    }
}

/// Materialise `upstream_id` inside an open transaction.
pub async fn materialise_in<D: ResourceDefinition + ?Sized>(
    def: &D,
    tx: &mut dyn ResourceTx,
    ctx: &FhirContext,
    upstream_id: &UpstreamId,
) -> Result<Materialised, MaterialiseError> {
    let table = def.resource_table();
    let existing = tx.find_by_upstream(table, upstream_id).await?;

    let mut upstream = None;
    for model in def.upstream_models() {
        if let Some(row) = tx.load_upstream(model, upstream_id).await? {
            upstream = Some(row);
            break;
        }
    }

    let Some(row) = upstream else {
        return match existing {
            Some(mut current) if current.is_live => {
                let expected = ExpectedVersion::Exact(current.version_id);
                current.is_live = false;
                current.version_id = current.version_id.next();
                current.last_updated = Utc::now();
                tx.write_resource(&current, expected).await?;
                warn!(resource = def.fhir_name(), upstream_id = %upstream_id, "upstream row gone, resource tombstoned");
                Ok(Materialised {
                    changed: true,
                    ..Materialised::from(&current)
                })
            }
            Some(current) => Ok(Materialised::from(&current)),
            None => Err(MaterialiseError::UpstreamNotFound {
                resource: def.fhir_name().to_string(),
                upstream_id: upstream_id.clone(),
            }),
        };
    };

    let is_live = def.upstream_is_live(&row);
    if let Some(current) = existing.as_ref().filter(|c| c.resolved && !c.is_live && !is_live) {
        let mut scope = MaterialiseScope::new(&mut *tx, ctx);
        if !def.should_force_rematerialise(current, &row, &mut scope).await? {
            debug!(resource = def.fhir_name(), upstream_id = %upstream_id, "resource stays not live, skipped");
            return Ok(Materialised::from(current));
        }
    }

    let (document, unresolved, related) = {
        let mut scope = MaterialiseScope::new(&mut *tx, ctx);
        let document = def.transform(&row, &mut scope).await?;
        let related = def.related_upstream_ids(&row, &mut scope).await?;
        (document, scope.unresolved(), related)
    };
    let resolved = unresolved == 0;

    let (resource, expected) = match existing {
        Some(current)
            if current.data == document && current.is_live == is_live && current.resolved == resolved =>
        {
            debug!(resource = def.fhir_name(), upstream_id = %upstream_id, "resource up to date");
            return Ok(Materialised {
                related,
                ..Materialised::from(&current)
            });
        }
        Some(current) => {
            let expected = ExpectedVersion::Exact(current.version_id);
            let resource = MaterialisedResource {
                version_id: current.version_id.next(),
                data: document,
                last_updated: Utc::now(),
                is_live,
                resolved,
                ..current
            };
            (resource, expected)
        }
        None => {
            let resource = MaterialisedResource {
                id: ResourceId::new(),
                upstream_id: upstream_id.clone(),
                resource_table: table.to_string(),
                version_id: VersionId::INITIAL,
                data: document,
                last_updated: Utc::now(),
                is_live,
                resolved,
            };
            (resource, ExpectedVersion::Absent)
        }
    };

    tx.write_resource(&resource, expected).await?;
    debug!(
        resource = def.fhir_name(),
        upstream_id = %upstream_id,
        version_id = %resource.version_id,
        resolved,
        "resource materialised"
    );

    Ok(Materialised {
        changed: true,
        related,
        ..Materialised::from(&resource)
    })
}

/// Materialise in its own transaction, then the related rows it names.
pub async fn materialise_from_upstream<D: ResourceDefinition + ?Sized>(
    def: &D,
    store: &dyn ResourceStore,
    ctx: &FhirContext,
    upstream_id: &UpstreamId,
) -> Result<Materialised, MaterialiseError> {
    let done = materialise_retrying(def, store, ctx, upstream_id).await?;
    for related in related_ids(&done, upstream_id) {
        materialise_retrying(def, store, ctx, &related).await?;
    }
    Ok(done)
}

/// `done.related` without `upstream_id` and duplicates.
fn related_ids(done: &Materialised, upstream_id: &UpstreamId) -> BTreeSet<UpstreamId> {
    done.related
        .iter()
        .filter(|id| *id != upstream_id)
        .cloned()
        .collect()
}

/// One materialisation, redone on a fresh transaction when the write goes stale.
async fn materialise_retrying<D: ResourceDefinition + ?Sized>(
    def: &D,
    store: &dyn ResourceStore,
    ctx: &FhirContext,
    upstream_id: &UpstreamId,
) -> Result<Materialised, MaterialiseError> {
    let mut attempt = 1;
    loop {
        let mut tx = store.begin().await?;
        match materialise_in(def, tx.as_mut(), ctx, upstream_id).await {
            Ok(done) => {
                tx.commit().await?;
                return Ok(done);
            }
            Err(MaterialiseError::Store(e)) if e.is_stale_write() && attempt < MAX_STALE_WRITE_ATTEMPTS => {
                tx.rollback().await?;
                debug!(resource = def.fhir_name(), upstream_id = %upstream_id, attempt, "stale write, retrying");
                attempt += 1;
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        }
    }
}

/// Inside an open transaction: re-read and redo on a stale write. `None` once
/// every attempt lost its race.
async fn materialise_in_retrying<D: ResourceDefinition + ?Sized>(
    def: &D,
    tx: &mut dyn ResourceTx,
    ctx: &FhirContext,
    upstream_id: &UpstreamId,
) -> Result<Option<Materialised>, MaterialiseError> {
    for attempt in 1..=MAX_STALE_WRITE_ATTEMPTS {
        match materialise_in(def, &mut *tx, ctx, upstream_id).await {
            Ok(done) => return Ok(Some(done)),
            Err(MaterialiseError::Store(e)) if e.is_stale_write() => {
                debug!(resource = def.fhir_name(), upstream_id = %upstream_id, attempt, "stale write in resolver pass");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Re-materialise every live, unresolved row of `def`. Default resolve step.
pub async fn rematerialise_unresolved<D: ResourceDefinition + ?Sized>(
    def: &D,
    tx: &mut dyn ResourceTx,
    ctx: &FhirContext,
) -> Result<ResolveSummary, MaterialiseError> {
    let pending = tx.unresolved_upstream_ids(def.resource_table()).await?;
    let mut summary = ResolveSummary::default();

    for upstream_id in &pending {
        let wrap = |e| MaterialiseError::Resolve {
            resource: def.fhir_name().to_string(),
            upstream_id: upstream_id.clone(),
            source: Box::new(e),
        };

        let Some(done) = materialise_in_retrying(def, &mut *tx, ctx, upstream_id)
            .await
            .map_err(wrap)?
        else {
            warn!(resource = def.fhir_name(), upstream_id = %upstream_id, "row kept losing write races, deferred");
            summary.deferred.push(upstream_id.clone());
            continue;
        };
        summary.rows += 1;

        for related in related_ids(&done, upstream_id) {
            if materialise_in_retrying(def, &mut *tx, ctx, &related)
                .await
                .map_err(wrap)?
                .is_none()
            {
                summary.deferred.push(related);
            }
        }
    }
    Ok(summary)
}
