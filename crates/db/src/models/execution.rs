use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    // Reserved; no transition currently produces it.
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub output: String,
    pub files: Vec<String>,
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub duration_ms: i64,
}

/// Persisted mirror of one supervised agent run.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub result: Option<sqlx::types::Json<ExecutionResult>>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const EXECUTION_COLUMNS: &str =
    "id, task_id, status, progress, result, error, started_at, completed_at, created_at";

impl Execution {
    pub async fn create(
        pool: &SqlitePool,
        task_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Execution>(&format!(
            r#"INSERT INTO executions (id, task_id, status, progress, started_at, created_at)
               VALUES ($1, $2, $3, 0, $4, $5)
               RETURNING {EXECUTION_COLUMNS}"#
        ))
        .bind(execution_id)
        .bind(task_id)
        .bind(ExecutionStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE task_id = $1 ORDER BY created_at ASC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    /// Executions the database still believes are live, for startup recovery.
    pub async fn find_unfinished(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Execution>(&format!(
            r#"SELECT {EXECUTION_COLUMNS} FROM executions
               WHERE status IN ('pending', 'running')
               ORDER BY created_at ASC"#
        ))
        .fetch_all(pool)
        .await
    }

    /// Progress only ever moves forward; stale updates are ignored.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: Uuid,
        progress: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE executions SET progress = $2 WHERE id = $1 AND progress < $2")
            .bind(id)
            .bind(progress)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(
        pool: &SqlitePool,
        id: Uuid,
        completed_at: DateTime<Utc>,
        result: &ExecutionResult,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE executions
               SET status = $2, progress = 1.0, result = $3, completed_at = $4
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(ExecutionStatus::Completed)
        .bind(sqlx::types::Json(result))
        .bind(completed_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE executions
               SET status = $2, error = $3, completed_at = $4
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(ExecutionStatus::Failed)
        .bind(error)
        .bind(completed_at)
        .execute(pool)
        .await?;
        Ok(())
    }

}
