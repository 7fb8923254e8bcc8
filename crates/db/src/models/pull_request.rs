use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "pr_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Merged,
    Closed,
}

impl std::fmt::Display for PrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrStatus::Open => "open",
            PrStatus::Merged => "merged",
            PrStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: Uuid,
    pub task_id: Uuid,
    pub repository: String,
    pub github_pr_number: i64,
    pub status: PrStatus,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub merged_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePullRequest {
    pub task_id: Uuid,
    pub repository: String,
    pub github_pr_number: i64,
}

/// Fields refreshed from the GitHub side on a status change.
#[derive(Debug, Clone, Default)]
pub struct PrStatusUpdate {
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub merged_by: Option<String>,
}

const PR_COLUMNS: &str = r#"id, task_id, repository, github_pr_number, status, merged_at,
    closed_at, merge_commit_sha, merged_by, created_at, updated_at"#;

impl PullRequest {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreatePullRequest,
        pr_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, PullRequest>(&format!(
            r#"INSERT INTO pull_requests (id, task_id, repository, github_pr_number, status,
                                          created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING {PR_COLUMNS}"#
        ))
        .bind(pr_id)
        .bind(data.task_id)
        .bind(&data.repository)
        .bind(data.github_pr_number)
        .bind(PrStatus::Open)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PullRequest>(&format!(
            "SELECT {PR_COLUMNS} FROM pull_requests WHERE task_id = $1 ORDER BY created_at ASC"
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn get_open_prs(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, PullRequest>(&format!(
            "SELECT {PR_COLUMNS} FROM pull_requests WHERE status = 'open' ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: PrStatus,
        update: &PrStatusUpdate,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE pull_requests
               SET status = $2, merged_at = $3, closed_at = $4, merge_commit_sha = $5,
                   merged_by = $6, updated_at = $7
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(status)
        .bind(update.merged_at)
        .bind(update.closed_at)
        .bind(&update.merge_commit_sha)
        .bind(&update.merged_by)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }
}
