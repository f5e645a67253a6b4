//! Postgres-backed resource and backfill stores.
//!
//! Materialised rows live in `fhir.<resource_table>` and are keyed by a unique
//! text `upstream_id`. Upstream tables are read in place. Their `id` column is
//! compared against a parameter cast to its [`UpstreamIdType`], never the
//! other way round, so lookups use the primary key.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `StaleWrite` (on resource writes) / `Storage` |
//! | Database (undefined table) | `42P01` | `UnknownTable` |
//! | Database (other) | Any other | `Storage` |
//! | Decode / ColumnNotFound | N/A | `Decode` |

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use fhirmat_core::{ExpectedVersion, ResourceId, UpstreamId, VersionId};

use super::definition::{UpstreamIdType, UpstreamModel};
use super::predicate::{SqlParams, validate_identifier};
use super::store::{
    BackfillScope, BackfillStore, BackfillTarget, MaterialisedResource, ResourceStore, ResourceTx,
    StoreError, UpstreamRow,
};
use crate::jobs::{JobPriority, topics};

const RESOURCE_COLUMNS: &str = "id, upstream_id, version_id, data, last_updated, is_live, resolved";

/// Resource store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresResourceStore {
    pool: PgPool,
}

impl PostgresResourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ResourceStore for PostgresResourceStore {
    async fn begin(&self) -> Result<Box<dyn ResourceTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresResourceTx { tx }))
    }

    async fn get_resource(
        &self,
        resource_table: &str,
        upstream_id: &UpstreamId,
    ) -> Result<Option<MaterialisedResource>, StoreError> {
        let row = sqlx::query(&select_resource_sql(resource_table)?)
            .bind(upstream_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_resource", e))?;

        row.map(|row| decode_resource(resource_table, &row)).transpose()
    }
}

struct PostgresResourceTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl ResourceTx for PostgresResourceTx {
    #[instrument(skip_all, fields(table = %upstream.table, upstream_id = %id), err)]
    async fn load_upstream(
        &mut self,
        upstream: &UpstreamModel,
        id: &UpstreamId,
    ) -> Result<Option<UpstreamRow>, StoreError> {
        let sql = load_upstream_sql(upstream)?;
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_upstream", e))?;

        match row {
            Some(row) => {
                let data = row
                    .try_get("data")
                    .map_err(|e| map_sqlx_error("load_upstream", e))?;
                Ok(Some(UpstreamRow {
                    table: upstream.table.clone(),
                    id: id.clone(),
                    data,
                }))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(table = %table, column = %column, value = %value), err)]
    async fn find_upstream_ids(
        &mut self,
        table: &str,
        column: &str,
        column_type: UpstreamIdType,
        value: &UpstreamId,
    ) -> Result<Vec<UpstreamId>, StoreError> {
        let sql = format!(
            "SELECT upstream.id::text AS id FROM {} AS upstream WHERE upstream.{} = {} ORDER BY 1",
            quote(table)?,
            quote(column)?,
            column_type.placeholder(1)
        );
        let rows = sqlx::query(&sql)
            .bind(value.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_upstream_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map(UpstreamId::new)
                    .map_err(|e| map_sqlx_error("find_upstream_ids", e))
            })
            .collect()
    }

    async fn find_by_upstream(
        &mut self,
        resource_table: &str,
        upstream_id: &UpstreamId,
    ) -> Result<Option<MaterialisedResource>, StoreError> {
        let row = sqlx::query(&select_resource_sql(resource_table)?)
            .bind(upstream_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_by_upstream", e))?;

        row.map(|row| decode_resource(resource_table, &row)).transpose()
    }

    #[instrument(
        skip_all,
        fields(
            table = %resource.resource_table,
            upstream_id = %resource.upstream_id,
            version_id = %resource.version_id,
            expected = ?expected
        ),
        err
    )]
    async fn write_resource(
        &mut self,
        resource: &MaterialisedResource,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let table = format!("fhir.{}", quote(&resource.resource_table)?);
        let stale = || StoreError::StaleWrite {
            resource_table: resource.resource_table.clone(),
            upstream_id: resource.upstream_id.clone(),
            expected,
        };

        let result = match expected {
            ExpectedVersion::Absent => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO {table} ({RESOURCE_COLUMNS})
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (upstream_id) DO NOTHING
                    "#
                ))
                .bind(resource.id.as_uuid())
                .bind(resource.upstream_id.as_str())
                .bind(version_to_db(resource.version_id))
                .bind(&resource.data)
                .bind(resource.last_updated)
                .bind(resource.is_live)
                .bind(resource.resolved)
                .execute(&mut *self.tx)
                .await
            }
            ExpectedVersion::Exact(current) => {
                sqlx::query(&format!(
                    r#"
                    UPDATE {table}
                    SET version_id = $3, data = $4, last_updated = $5, is_live = $6, resolved = $7
                    WHERE upstream_id = $1 AND version_id = $2
                    "#
                ))
                .bind(resource.upstream_id.as_str())
                .bind(version_to_db(current))
                .bind(version_to_db(resource.version_id))
                .bind(&resource.data)
                .bind(resource.last_updated)
                .bind(resource.is_live)
                .bind(resource.resolved)
                .execute(&mut *self.tx)
                .await
            }
        };

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => Err(stale()),
            Err(e) if is_unique_violation(&e) => Err(stale()),
            Err(e) => Err(map_sqlx_error("write_resource", e)),
        }
    }

    async fn unresolved_upstream_ids(
        &mut self,
        resource_table: &str,
    ) -> Result<Vec<UpstreamId>, StoreError> {
        let sql = format!(
            "SELECT upstream_id FROM fhir.{} WHERE is_live AND NOT resolved ORDER BY upstream_id",
            quote(resource_table)?
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("unresolved_upstream_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("upstream_id")
                    .map(UpstreamId::new)
                    .map_err(|e| map_sqlx_error("unresolved_upstream_ids", e))
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Anti-join counts and `INSERT ... SELECT` backfills over upstream tables.
#[derive(Debug, Clone)]
pub struct PostgresBackfillStore {
    pool: PgPool,
}

impl PostgresBackfillStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// `FROM ... WHERE ...` selecting the target's upstream rows.
fn upstream_selection(
    target: &BackfillTarget,
    scope: BackfillScope,
    params: &mut SqlParams,
) -> Result<String, StoreError> {
    let mut conditions = Vec::new();
    if scope == BackfillScope::Missing {
        if let Some(filter) = &target.filter {
            conditions.push(format!("({})", filter.to_sql("upstream", params)?));
        }
        conditions.push(format!(
            "NOT EXISTS (SELECT 1 FROM fhir.{} AS resource WHERE resource.upstream_id = {})",
            quote(&target.resource_table)?,
            target.upstream_id_type.as_text("upstream.id")
        ));
    }

    let mut sql = format!("FROM {} AS upstream", quote(&target.upstream_table)?);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    Ok(sql)
}

#[async_trait::async_trait]
impl BackfillStore for PostgresBackfillStore {
    #[instrument(skip_all, fields(resource = %target.resource, upstream = %target.upstream_table), err)]
    async fn count_missing(&self, target: &BackfillTarget) -> Result<u64, StoreError> {
        let mut params = SqlParams::default();
        let sql = format!(
            "SELECT count(*) AS missing {}",
            upstream_selection(target, BackfillScope::Missing, &mut params)?
        );

        let mut query = sqlx::query(&sql);
        for value in params.values() {
            query = query.bind(value);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_missing", e))?;

        let missing: i64 = row
            .try_get("missing")
            .map_err(|e| map_sqlx_error("count_missing", e))?;
        Ok(missing.max(0) as u64)
    }

    #[instrument(skip_all, fields(resource = %target.resource, upstream = %target.upstream_table, scope = ?scope), err)]
    async fn enqueue_upstream(
        &self,
        target: &BackfillTarget,
        scope: BackfillScope,
    ) -> Result<u64, StoreError> {
        let mut params = SqlParams::starting_after(3);
        let selection = upstream_selection(target, scope, &mut params)?;
        let sql = format!(
            r#"
            INSERT INTO fhir.jobs (id, topic, payload, status, attempts, priority)
            SELECT gen_random_uuid(),
                   $1,
                   jsonb_build_object('resource', $2::text, 'upstreamId', upstream.id::text),
                   'pending',
                   0,
                   $3
            {selection}
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(topics::FROM_UPSTREAM)
            .bind(&target.resource)
            .bind(JobPriority::LOW.0);
        for value in params.values() {
            query = query.bind(value);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue_upstream", e))?;
        Ok(result.rows_affected())
    }
}

fn quote(identifier: &str) -> Result<String, StoreError> {
    Ok(format!("\"{}\"", validate_identifier(identifier)?))
}

fn load_upstream_sql(upstream: &UpstreamModel) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT to_jsonb(upstream) AS data FROM {} AS upstream WHERE upstream.id = {}",
        quote(&upstream.table)?,
        upstream.id_type.placeholder(1)
    ))
}

fn select_resource_sql(resource_table: &str) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT {RESOURCE_COLUMNS} FROM fhir.{} WHERE upstream_id = $1",
        quote(resource_table)?
    ))
}

fn version_to_db(version: VersionId) -> i64 {
    i64::try_from(version.get()).unwrap_or(i64::MAX)
}

struct ResourceRow {
    id: Uuid,
    upstream_id: String,
    version_id: i64,
    data: serde_json::Value,
    last_updated: DateTime<Utc>,
    is_live: bool,
    resolved: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ResourceRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ResourceRow {
            id: row.try_get("id")?,
            upstream_id: row.try_get("upstream_id")?,
            version_id: row.try_get("version_id")?,
            data: row.try_get("data")?,
            last_updated: row.try_get("last_updated")?,
            is_live: row.try_get("is_live")?,
            resolved: row.try_get("resolved")?,
        })
    }
}

fn decode_resource(
    resource_table: &str,
    row: &sqlx::postgres::PgRow,
) -> Result<MaterialisedResource, StoreError> {
    use sqlx::FromRow;
    let row = ResourceRow::from_row(row)
        .map_err(|e| StoreError::Decode(format!("failed to deserialize resource row: {e}")))?;
    let version_id = u64::try_from(row.version_id)
        .ok()
        .and_then(|v| VersionId::new(v).ok())
        .ok_or_else(|| StoreError::Decode(format!("invalid version_id {}", row.version_id)))?;

    Ok(MaterialisedResource {
        id: ResourceId::from_uuid(row.id),
        upstream_id: UpstreamId::new(row.upstream_id),
        resource_table: resource_table.to_string(),
        version_id,
        data: row.data,
        last_updated: row.last_updated,
        is_live: row.is_live,
        resolved: row.resolved,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Map sqlx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") => StoreError::UnknownTable(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Predicate;

    fn target(filter: Option<Predicate>) -> BackfillTarget {
        BackfillTarget {
            resource: "Encounter".into(),
            resource_table: "encounters".into(),
            upstream_table: "encounters".into(),
            upstream_id_type: UpstreamIdType::Uuid,
            filter,
        }
    }

    #[test]
    fn missing_selection_is_one_anti_join() {
        let mut params = SqlParams::starting_after(3);
        let sql = upstream_selection(
            &target(Some(Predicate::is_null("deleted_at"))),
            BackfillScope::Missing,
            &mut params,
        )
        .unwrap();

        assert_eq!(
            sql,
            "FROM \"encounters\" AS upstream WHERE (upstream.\"deleted_at\" IS NULL) AND \
             NOT EXISTS (SELECT 1 FROM fhir.\"encounters\" AS resource \
             WHERE resource.upstream_id = upstream.id::text)"
        );
        assert!(params.values().is_empty());
    }

    #[test]
    fn text_ids_join_without_a_cast() {
        let mut params = SqlParams::default();
        let sql = upstream_selection(
            &BackfillTarget {
                upstream_id_type: UpstreamIdType::Text,
                ..target(None)
            },
            BackfillScope::Missing,
            &mut params,
        )
        .unwrap();
        assert!(sql.ends_with("WHERE resource.upstream_id = upstream.id)"), "{sql}");
    }

    #[test]
    fn upstream_lookups_cast_the_parameter_not_the_key() {
        let uuid = load_upstream_sql(&UpstreamModel::with_id_type("patients", UpstreamIdType::Uuid)).unwrap();
        assert_eq!(
            uuid,
            "SELECT to_jsonb(upstream) AS data FROM \"patients\" AS upstream WHERE upstream.id = $1::uuid"
        );
        let text = load_upstream_sql(&UpstreamModel::new("patients")).unwrap();
        assert!(text.ends_with("WHERE upstream.id = $1"));
        assert!(!text.contains("id::text"));
    }

    #[test]
    fn full_refresh_ignores_the_filter() {
        let mut params = SqlParams::default();
        let sql = upstream_selection(
            &target(Some(Predicate::eq("status", "active"))),
            BackfillScope::All,
            &mut params,
        )
        .unwrap();

        assert_eq!(sql, "FROM \"encounters\" AS upstream");
        assert!(params.values().is_empty());
    }

    #[test]
    fn filter_params_follow_fixed_params() {
        let mut params = SqlParams::starting_after(3);
        let sql = upstream_selection(
            &target(Some(Predicate::eq("status", "active"))),
            BackfillScope::Missing,
            &mut params,
        )
        .unwrap();
        assert!(sql.contains("upstream.\"status\"::text = $4"));
        assert_eq!(params.values(), ["active"]);
    }

    #[test]
    fn identifiers_are_validated_before_quoting() {
        assert!(quote("patients").is_ok());
        assert!(matches!(quote("patients\"; --"), Err(StoreError::Predicate(_))));
    }
}
