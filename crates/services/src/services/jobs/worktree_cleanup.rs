use std::path::Path;

use chrono::Utc;
use db::models::{job::Job, project::Project, task::Task};
use utils::path::is_safe_cleanup_path;

use super::JobProcessor;
use crate::services::{queue::JobError, worktree::project_repo_dir};

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupReport {
    pub succeeded: usize,
    pub failed: usize,
    pub refused_unsafe: usize,
}

impl JobProcessor {
    /// `worktree:cleanup`: drop worktrees whose task saw no activity within
    /// the retention window. Per-task failures are counted, not fatal.
    pub async fn handle_worktree_cleanup(&self, _job: &Job) -> Result<(), JobError> {
        let report = self.cleanup_stale_worktrees().await?;
        tracing::info!(
            "Worktree cleanup finished: {} removed, {} failed, {} refused",
            report.succeeded,
            report.failed,
            report.refused_unsafe
        );
        Ok(())
    }

    pub async fn cleanup_stale_worktrees(&self) -> Result<CleanupReport, JobError> {
        let before = Utc::now() - self.config.worktree_retention;
        let tasks = Task::find_eligible_for_worktree_cleanup(&self.db.pool, before).await?;
        let mut report = CleanupReport::default();

        for task in tasks {
            match self.cleanup_task_worktree(&task).await {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.refused_unsafe += 1,
                Err(e) => {
                    tracing::error!("Worktree cleanup failed for task {}: {e}", task.id);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Returns Ok(false) when the worktree path was refused as unsafe; the
    /// task is left untouched and stays eligible next run.
    async fn cleanup_task_worktree(&self, task: &Task) -> Result<bool, JobError> {
        let Some(worktree_path) = task.worktree_path.as_deref() else {
            return Ok(true);
        };

        let repo_dir = match Project::find_by_id(&self.db.pool, task.project_id).await? {
            Some(project) => Some(project_repo_dir(Path::new(&project.worktree_base_path))),
            None => None,
        };

        if let Some(repo_dir) = &repo_dir {
            if let Err(e) = self
                .git
                .delete_worktree(repo_dir, Path::new(worktree_path))
                .await
            {
                tracing::warn!(
                    "Failed to remove git worktree for task {}: {e}",
                    task.id
                );
            }
            if let Some(branch) = task.branch_name.as_deref()
                && let Err(e) = self.git.delete_branch(repo_dir, branch, true).await
            {
                tracing::warn!("Failed to delete branch {branch} for task {}: {e}", task.id);
            }
        }

        if !is_safe_cleanup_path(worktree_path) {
            tracing::warn!(
                "Refusing to delete unsafe worktree path {worktree_path} for task {}; \
                 operator intervention required",
                task.id
            );
            return Ok(false);
        }

        if Path::new(worktree_path).exists()
            && let Err(e) = tokio::fs::remove_dir_all(worktree_path).await
        {
            tracing::warn!(
                "Failed to delete worktree directory {worktree_path}: {e}"
            );
        }

        Task::clear_worktree(&self.db.pool, task.id).await?;
        Ok(true)
    }
}
