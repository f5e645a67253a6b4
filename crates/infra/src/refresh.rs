//! Full-resource refresh and upstream fan-out.

use std::collections::BTreeSet;

use tracing::info;

use fhirmat_core::{Capability, UpstreamId};

use crate::context::FhirContext;
use crate::jobs::{AllFromUpstream, JobPayload, JobStoreError, SubmitOptions};
use crate::resources::{
    BackfillScope, BackfillTarget, CatalogError, ResourceTx, StoreError, UpstreamLookup,
    UpstreamModel, id_from_json,
};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("resource {0} is not materialisable")]
    NotMaterialisable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// Enqueue a materialisation of every upstream row of `resource`, ignoring
/// its eligibility filter. One bulk statement per upstream table.
pub async fn refresh_entire_resource(ctx: &FhirContext, resource: &str) -> Result<u64, RefreshError> {
    let def = ctx.catalog.get(resource)?;
    if !def.can_do(Capability::Materialise) {
        return Err(RefreshError::NotMaterialisable(resource.to_string()));
    }

    let mut total = 0;
    for upstream in def.upstream_models() {
        let target = BackfillTarget::new(def.as_ref(), upstream);
        let n = ctx.backfill.enqueue_upstream(&target, BackfillScope::All).await?;
        info!(resource, upstream = %upstream.table, total = n, "enqueued full refresh");
        total += n;
    }
    Ok(total)
}

/// One `fromUpstream` job for each materialisable resource row affected by
/// `change`. Resources built from `change.table` get the changed id itself;
/// the others are asked which of their upstream rows the change touches.
pub async fn refresh_all_from_upstream(
    ctx: &FhirContext,
    change: &AllFromUpstream,
) -> Result<u64, RefreshError> {
    let mut targets: BTreeSet<(String, UpstreamId)> = BTreeSet::new();
    for def in ctx.catalog.with_upstream_table(&change.table) {
        targets.insert((def.fhir_name().to_string(), change.id.clone()));
    }

    let mut tx: Option<Box<dyn ResourceTx>> = None;
    for def in ctx.catalog.resources_that_can_do(Capability::Materialise) {
        for model in def.upstream_models() {
            if model.table == change.table {
                continue;
            }
            let Some(lookup) = def.upstream_ids_from_table(
                &model.table,
                &change.table,
                &change.id,
                change.deleted_row.as_ref(),
            ) else {
                continue;
            };
            if tx.is_none() {
                tx = Some(ctx.resources.begin().await?);
            }
            if let Some(tx) = tx.as_mut() {
                for id in lookup_ids(tx.as_mut(), model, change, lookup).await? {
                    targets.insert((def.fhir_name().to_string(), id));
                }
            }
        }
    }
    if let Some(tx) = tx {
        tx.rollback().await?;
    }

    let mut submitted = 0;
    for (resource, id) in targets {
        let payload = JobPayload::from_upstream(resource, id);
        if ctx.jobs.submit_payload(&payload, SubmitOptions::default()).await?.is_some() {
            submitted += 1;
        }
    }
    info!(
        upstream = %change.table,
        upstream_id = %change.id,
        op = ?change.op,
        total = submitted,
        "fanned out upstream change"
    );
    Ok(submitted)
}

async fn lookup_ids(
    tx: &mut dyn ResourceTx,
    model: &UpstreamModel,
    change: &AllFromUpstream,
    lookup: UpstreamLookup,
) -> Result<Vec<UpstreamId>, RefreshError> {
    match lookup {
        UpstreamLookup::Ids(ids) => Ok(ids),
        UpstreamLookup::Referencing { column, column_type } => Ok(tx
            .find_upstream_ids(&model.table, &column, column_type, &change.id)
            .await?),
        UpstreamLookup::ReferencedBy { column, id_type } => {
            if let Some(row) = &change.deleted_row {
                return Ok(row.get(column.as_str()).and_then(id_from_json).into_iter().collect());
            }
            let changed = UpstreamModel::with_id_type(change.table.as_str(), id_type);
            Ok(tx
                .load_upstream(&changed, &change.id)
                .await?
                .and_then(|row| row.upstream_id(&column))
                .into_iter()
                .collect())
        }
    }
}
