//! Postgres-backed job store.
//!
//! Jobs live in `fhir.jobs` (see `schema.sql`). The store relies on two
//! database guarantees:
//!
//! - Claiming selects the next row with `FOR UPDATE SKIP LOCKED` inside the
//!   same statement that marks it claimed, so concurrent workers never receive
//!   the same job and never block on each other.
//! - The partial unique index on `(topic, discriminant) WHERE status IN
//!   ('pending', 'claimed')` turns a duplicate submission into a no-op through
//!   `ON CONFLICT DO NOTHING`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Storage` (conflict) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Decode / ColumnNotFound | N/A | `Decode` |

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use fhirmat_core::WorkerId;

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobPriority, JobRetention, JobStatus, SubmitOptions};

const JOB_COLUMNS: &str = "id, topic, payload, status, attempts, priority, discriminant, \
                           created_at, run_after, claimed_at, claimed_by, error";

/// Postgres job store. Cheap to clone; shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    retention: JobRetention,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, retention: JobRetention) -> Self {
        Self { pool, retention }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why an update guarded by `status = 'claimed' AND claimed_by`
    /// touched no row.
    async fn claim_miss(&self, job_id: JobId, worker: WorkerId) -> JobStoreError {
        let row = sqlx::query("SELECT status, claimed_by FROM fhir.jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return JobStoreError::NotFound(job_id),
            Err(e) => return map_sqlx_error("claim_miss", e),
        };
        let (raw, owner) = match (
            row.try_get::<String, _>("status"),
            row.try_get::<Option<Uuid>, _>("claimed_by"),
        ) {
            (Ok(raw), Ok(owner)) => (raw, owner),
            (Err(e), _) | (_, Err(e)) => return map_sqlx_error("claim_miss", e),
        };

        match JobStatus::parse(&raw) {
            Some(JobStatus::Claimed) if owner.as_ref() != Some(worker.as_uuid()) => {
                JobStoreError::ClaimLost { id: job_id, worker }
            }
            Some(status) => JobStoreError::NotClaimed { id: job_id, status },
            None => JobStoreError::Decode(format!("unknown job status {raw:?}")),
        }
    }

    /// Run a claim transition; `$1` is the job id and `$2` the owning worker.
    async fn transition(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        job_id: JobId,
        worker: WorkerId,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_miss(job_id, worker).await);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(topic = %topic, discriminant = ?options.discriminant, collapsed = tracing::field::Empty), err)]
    async fn submit(
        &self,
        topic: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO fhir.jobs (id, topic, payload, status, attempts, priority, discriminant)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobId::new().0)
        .bind(topic)
        .bind(&payload)
        .bind(options.priority.0)
        .bind(options.discriminant.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("submit", e))?;

        Span::current().record("collapsed", row.is_none());
        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip_all, fields(worker_id = %worker, topics = topics.len()), err)]
    async fn claim_next(
        &self,
        worker: WorkerId,
        topics: &[String],
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id FROM fhir.jobs
                WHERE status = 'pending'
                  AND topic = ANY($1)
                  AND (run_after IS NULL OR run_after <= now())
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE fhir.jobs AS jobs
            SET status = 'claimed',
                attempts = jobs.attempts + 1,
                claimed_at = now(),
                claimed_by = $2
            FROM next
            WHERE jobs.id = next.id
            RETURNING {}
            "#,
            qualified_columns("jobs")
        ))
        .bind(topics)
        .bind(worker.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker), err)]
    async fn complete(&self, job_id: JobId, worker: WorkerId) -> Result<(), JobStoreError> {
        let sql = match self.retention {
            JobRetention::Delete => {
                "DELETE FROM fhir.jobs WHERE id = $1 AND status = 'claimed' AND claimed_by = $2"
            }
            JobRetention::Keep => {
                "UPDATE fhir.jobs SET status = 'done', error = NULL \
                 WHERE id = $1 AND status = 'claimed' AND claimed_by = $2"
            }
        };

        let query = sqlx::query(sql).bind(job_id.0).bind(worker.as_uuid());
        self.transition("complete", query, job_id, worker).await
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker), err)]
    async fn fail(&self, job_id: JobId, worker: WorkerId, error: &str) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE fhir.jobs SET status = 'failed', error = $3
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker.as_uuid())
        .bind(error);
        self.transition("fail", query, job_id, worker).await
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker, run_after = %run_after), err)]
    async fn retry(
        &self,
        job_id: JobId,
        worker: WorkerId,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE fhir.jobs
            SET status = 'pending', error = $3, run_after = $4, claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker.as_uuid())
        .bind(error)
        .bind(run_after);
        self.transition("retry", query, job_id, worker).await
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker), err)]
    async fn release(&self, job_id: JobId, worker: WorkerId) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE fhir.jobs
            SET status = 'pending',
                attempts = GREATEST(attempts - 1, 0),
                claimed_at = NULL,
                claimed_by = NULL
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(job_id.0)
        .bind(worker.as_uuid());
        self.transition("release", query, job_id, worker).await
    }

    async fn count_queue(&self, topic: Option<&str>) -> Result<u64, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS depth FROM fhir.jobs
            WHERE status IN ('pending', 'claimed')
              AND ($1::text IS NULL OR topic = $1)
            "#,
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_queue", e))?;

        let depth: i64 = row.try_get("depth").map_err(|e| map_sqlx_error("count_queue", e))?;
        Ok(depth.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fhir.jobs
            SET status = 'pending', claimed_at = NULL, claimed_by = NULL
            WHERE status = 'claimed' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM fhir.jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, count(*) AS n FROM fhir.jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = n,
                Some(JobStatus::Claimed) => stats.claimed = n,
                Some(JobStatus::Done) => stats.done = n,
                Some(JobStatus::Failed) => stats.failed = n,
                None => return Err(JobStoreError::Decode(format!("unknown job status {status:?}"))),
            }
        }
        Ok(stats)
    }
}

fn qualified_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

struct JobRow {
    id: Uuid,
    topic: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    priority: i32,
    discriminant: Option<String>,
    created_at: DateTime<Utc>,
    run_after: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<Uuid>,
    error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            priority: row.try_get("priority")?,
            discriminant: row.try_get("discriminant")?,
            created_at: row.try_get("created_at")?,
            run_after: row.try_get("run_after")?,
            claimed_at: row.try_get("claimed_at")?,
            claimed_by: row.try_get("claimed_by")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Decode(format!("unknown job status {:?}", row.status)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            topic: row.topic,
            payload: row.payload,
            status,
            attempts: row.attempts.max(0) as u32,
            priority: JobPriority(row.priority),
            discriminant: row.discriminant,
            created_at: row.created_at,
            run_after: row.run_after,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by.map(WorkerId::from_uuid),
            error: row.error,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    use sqlx::FromRow;
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Decode(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

/// Map sqlx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Storage(format!("conflict: {msg}")),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_columns_prefix_every_column() {
        let cols = qualified_columns("jobs");
        assert!(cols.starts_with("jobs.id, jobs.topic"));
        assert!(cols.ends_with("jobs.error"));
        assert_eq!(cols.matches("jobs.").count(), JOB_COLUMNS.split(',').count());
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let row = JobRow {
            id: Uuid::now_v7(),
            topic: "t".into(),
            payload: serde_json::json!({}),
            status: "grabbed".into(),
            attempts: 0,
            priority: 500,
            discriminant: None,
            created_at: Utc::now(),
            run_after: None,
            claimed_at: None,
            claimed_by: None,
            error: None,
        };
        assert!(matches!(Job::try_from(row), Err(JobStoreError::Decode(_))));
    }
}
