use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "plan_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Reviewing,
    Approved,
    Rejected,
}

impl PlanStatus {
    /// A plan in this state unblocks the implementation phase.
    pub fn allows_implementation(&self) -> bool {
        matches!(self, PlanStatus::Approved | PlanStatus::Reviewing)
    }
}

/// Markdown artifact of a planning execution. A task may accumulate several
/// plans over re-runs; the latest one wins.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: PlanStatus,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub async fn create(
        pool: &SqlitePool,
        task_id: Uuid,
        content: &str,
        plan_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Plan>(
            r#"INSERT INTO plans (id, task_id, status, content, created_at)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, task_id, status, content, created_at"#,
        )
        .bind(plan_id)
        .bind(task_id)
        .bind(PlanStatus::Draft)
        .bind(content)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_latest_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Plan>(
            r#"SELECT id, task_id, status, content, created_at
               FROM plans
               WHERE task_id = $1
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: PlanStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE plans SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(pool)
            .await?;
        Ok(())
    }
}
