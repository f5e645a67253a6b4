//! Database schema for the job queue and materialised resources.

use sqlx::PgPool;
use tracing::info;

use crate::resources::{ResourceCatalog, StoreError, validate_identifier};

/// `fhir` schema and `fhir.jobs`.
pub const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// DDL for one `fhir.<table>` resource table.
pub fn resource_table_ddl(table: &str) -> Result<String, StoreError> {
    let table = validate_identifier(table)?;
    Ok(format!(
        r#"
        CREATE TABLE IF NOT EXISTS fhir."{table}" (
            id            UUID        PRIMARY KEY,
            upstream_id   TEXT        NOT NULL UNIQUE,
            version_id    BIGINT      NOT NULL,
            data          JSONB       NOT NULL,
            last_updated  TIMESTAMPTZ NOT NULL,
            is_live       BOOLEAN     NOT NULL DEFAULT TRUE,
            resolved      BOOLEAN     NOT NULL DEFAULT TRUE
        );
        CREATE INDEX IF NOT EXISTS "{table}_unresolved"
            ON fhir."{table}" (upstream_id)
            WHERE is_live AND NOT resolved;
        "#
    ))
}

/// Apply the queue schema plus one table per catalogued resource.
pub async fn apply_schema(pool: &PgPool, catalog: &ResourceCatalog) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| StoreError::Storage(format!("apply job schema: {e}")))?;

    for def in catalog.iter() {
        let ddl = resource_table_ddl(def.resource_table())?;
        sqlx::raw_sql(&ddl)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Storage(format!("create fhir.{}: {e}", def.resource_table())))?;
    }

    info!(resources = catalog.len(), "schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ddl_is_keyed_by_upstream_id() {
        let ddl = resource_table_ddl("patients").unwrap();
        assert!(ddl.contains(r#"fhir."patients""#));
        assert!(ddl.contains("upstream_id   TEXT        NOT NULL UNIQUE"));
    }

    #[test]
    fn hostile_table_names_are_rejected() {
        assert!(resource_table_ddl("patients; DROP TABLE x").is_err());
    }

    #[test]
    fn outstanding_jobs_are_unique_per_discriminant() {
        assert!(SCHEMA_SQL.contains("WHERE discriminant IS NOT NULL AND status IN ('pending', 'claimed')"));
    }
}
