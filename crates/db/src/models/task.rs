use chrono::{DateTime, Utc};
use executors::executors::AiType;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use uuid::Uuid;

use super::project::Project;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    Planning,
    PlanReviewing,
    Implementing,
    CodeReviewing,
    Done,
}

impl TaskStatus {
    /// Explicit transition table: the forward path plus failure edges back to
    /// the predecessor state and the re-run edges.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Todo, Planning)
                | (Planning, PlanReviewing)
                | (Planning, Todo)
                | (PlanReviewing, Planning)
                | (PlanReviewing, Implementing)
                | (Implementing, CodeReviewing)
                | (Implementing, PlanReviewing)
                | (CodeReviewing, Implementing)
                | (CodeReviewing, Done)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Planning => "planning",
            TaskStatus::PlanReviewing => "plan_reviewing",
            TaskStatus::Implementing => "implementing",
            TaskStatus::CodeReviewing => "code_reviewing",
            TaskStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "git_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GitStatus {
    None,
    Dirty,
    Clean,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: i64,
    pub status: TaskStatus,
    pub ai_type: AiType,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub git_status: GitStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTask {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: i64,
    pub ai_type: AiType,
}

const TASK_COLUMNS: &str = r#"id, project_id, title, description, priority, status, ai_type,
    branch_name, worktree_path, git_status, created_at, updated_at"#;

impl Task {
    pub async fn parent_project(&self, pool: &SqlitePool) -> Result<Option<Project>, sqlx::Error> {
        Project::find_by_id(pool, self.project_id).await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateTask,
        task_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Task>(&format!(
            r#"INSERT INTO tasks (id, project_id, title, description, priority, status, ai_type,
                                  git_status, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING {TASK_COLUMNS}"#
        ))
        .bind(task_id)
        .bind(data.project_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.priority)
        .bind(TaskStatus::Todo)
        .bind(data.ai_type)
        .bind(GitStatus::None)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update_worktree(
        pool: &SqlitePool,
        id: Uuid,
        branch_name: &str,
        worktree_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET branch_name = $2, worktree_path = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(branch_name)
        .bind(worktree_path)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_git_status(
        pool: &SqlitePool,
        id: Uuid,
        git_status: GitStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET git_status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(git_status)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Drop the worktree reference after cleanup; git status goes back to none.
    pub async fn clear_worktree(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET worktree_path = NULL, git_status = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(GitStatus::None)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Tasks whose worktree has seen no activity since `before`.
    pub async fn find_eligible_for_worktree_cleanup(
        pool: &SqlitePool,
        before: DateTime<Utc>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!(
            r#"SELECT {TASK_COLUMNS} FROM tasks
               WHERE worktree_path IS NOT NULL AND updated_at < $1
               ORDER BY updated_at ASC"#
        ))
        .bind(before)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_linear() {
        use TaskStatus::*;
        assert!(Todo.can_transition_to(Planning));
        assert!(Planning.can_transition_to(PlanReviewing));
        assert!(PlanReviewing.can_transition_to(Implementing));
        assert!(Implementing.can_transition_to(CodeReviewing));
        assert!(CodeReviewing.can_transition_to(Done));
    }

    #[test]
    fn failure_edges_revert_to_predecessor() {
        use TaskStatus::*;
        assert!(Planning.can_transition_to(Todo));
        assert!(Implementing.can_transition_to(PlanReviewing));
    }

    #[test]
    fn skipping_states_is_rejected() {
        use TaskStatus::*;
        assert!(!Todo.can_transition_to(Implementing));
        assert!(!Planning.can_transition_to(Done));
        assert!(!Done.can_transition_to(Todo));
        assert!(!Todo.can_transition_to(Todo));
    }
}
