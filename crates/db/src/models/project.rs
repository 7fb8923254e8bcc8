use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Projects are created by the HTTP layer; the core only reads them.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub worktree_base_path: String,
    pub repository_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProject {
    pub worktree_base_path: String,
    pub repository_url: String,
}

impl Project {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Project>(
            r#"SELECT id, worktree_base_path, repository_url, created_at, updated_at
               FROM projects
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProject,
        project_id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Project>(
            r#"INSERT INTO projects (id, worktree_base_path, repository_url, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, worktree_base_path, repository_url, created_at, updated_at"#,
        )
        .bind(project_id)
        .bind(&data.worktree_base_path)
        .bind(&data.repository_url)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    /// "owner/repo" slug derived from the repository URL, for the GitHub API.
    pub fn repository_slug(&self) -> Option<String> {
        let trimmed = self
            .repository_url
            .trim_end_matches('/')
            .trim_end_matches(".git");
        let mut segments = trimmed.rsplit('/');
        let repo = segments.next()?;
        let owner = segments.next()?;
        // the owner segment of an SSH remote looks like "git@github.com:owner"
        let owner = owner.rsplit(':').next()?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some(format!("{owner}/{repo}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(url: &str) -> Project {
        Project {
            id: Uuid::new_v4(),
            worktree_base_path: "/tmp/worktrees".into(),
            repository_url: url.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn slug_from_https_and_ssh_urls() {
        assert_eq!(
            project("https://github.com/acme/widget.git").repository_slug(),
            Some("acme/widget".into())
        );
        assert_eq!(
            project("git@github.com:acme/widget.git").repository_slug(),
            Some("acme/widget".into())
        );
        assert_eq!(project("widget").repository_slug(), None);
    }
}
