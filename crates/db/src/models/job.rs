use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Durable work item. Payloads are self-describing versioned JSON; handlers
/// must tolerate at-least-once delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub queue: String,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub status: JobStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub timeout_seconds: i64,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateJob {
    pub job_type: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub max_retries: i64,
    pub timeout_seconds: i64,
    pub scheduled_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"id, job_type, queue, payload, status, retry_count, max_retries,
    timeout_seconds, scheduled_at, started_at, finished_at, last_error, created_at"#;

impl Job {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateJob,
        job_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Job>(&format!(
            r#"INSERT INTO jobs (id, job_type, queue, payload, status, max_retries,
                                 timeout_seconds, scheduled_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING {JOB_COLUMNS}"#
        ))
        .bind(job_id)
        .bind(&data.job_type)
        .bind(&data.queue)
        .bind(sqlx::types::Json(&data.payload))
        .bind(JobStatus::Pending)
        .bind(data.max_retries)
        .bind(data.timeout_seconds)
        .bind(data.scheduled_at)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim the oldest due job on `queue`, flipping it to
    /// running. The claim-by-update keeps concurrent workers from dispatching
    /// the same job twice.
    pub async fn claim_next(pool: &SqlitePool, queue: &str) -> Result<Option<Self>, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Job>(&format!(
            r#"UPDATE jobs
               SET status = 'running', started_at = $2
               WHERE id = (
                   SELECT id FROM jobs
                   WHERE queue = $1 AND status = 'pending' AND scheduled_at <= $2
                   ORDER BY scheduled_at ASC, created_at ASC
                   LIMIT 1
               )
               RETURNING {JOB_COLUMNS}"#
        ))
        .bind(queue)
        .bind(now)
        .fetch_optional(pool)
        .await
    }

    pub async fn mark_completed(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET status = 'completed', finished_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', finished_at = $2, last_error = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Put a job back on the queue for a later attempt.
    pub async fn reschedule(
        pool: &SqlitePool,
        id: Uuid,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE jobs
               SET status = 'pending', retry_count = retry_count + 1, scheduled_at = $2,
                   started_at = NULL, last_error = $3
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(at)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Running jobs whose timeout (plus `grace`) elapsed without completion,
    /// e.g. after a worker crash. The queue requeues or fails them.
    pub async fn find_stale_running(
        pool: &SqlitePool,
        grace: Duration,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let now = Utc::now();
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running'"
        ))
        .fetch_all(pool)
        .await?;
        Ok(jobs
            .into_iter()
            .filter(|job| {
                job.started_at.is_some_and(|started| {
                    started + Duration::seconds(job.timeout_seconds) + grace < now
                })
            })
            .collect())
    }

    /// Whether a pending (or due) job of this type already exists, so periodic
    /// schedules don't pile up behind a slow handler.
    pub async fn has_pending(pool: &SqlitePool, job_type: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM jobs WHERE job_type = $1 AND status = 'pending' LIMIT 1",
        )
        .bind(job_type)
        .fetch_optional(pool)
        .await?;
        Ok(row.is_some())
    }
}
