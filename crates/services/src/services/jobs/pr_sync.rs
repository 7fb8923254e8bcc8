use db::models::{
    job::Job,
    pull_request::{PrStatus, PrStatusUpdate, PullRequest},
    task::{Task, TaskStatus},
};

use super::JobProcessor;
use crate::services::queue::JobError;

impl JobProcessor {
    /// `pr:status_sync` (periodic): reconcile every open PR against GitHub.
    /// Per-PR errors are isolated so one bad repository doesn't starve the
    /// rest of the sweep.
    pub async fn handle_pr_status_sync(&self, _job: &Job) -> Result<(), JobError> {
        let open_prs = PullRequest::get_open_prs(&self.db.pool).await?;
        if open_prs.is_empty() {
            tracing::debug!("No open PRs to check");
            return Ok(());
        }
        tracing::info!("Checking {} open PRs", open_prs.len());

        for pr in open_prs {
            if let Err(e) = self.sync_pr(&pr).await {
                tracing::error!(
                    "Error checking PR #{} for task {}: {e}",
                    pr.github_pr_number,
                    pr.task_id
                );
            }
        }
        Ok(())
    }

    async fn sync_pr(&self, pr: &PullRequest) -> Result<(), JobError> {
        let remote = self
            .github
            .get_pull_request(&pr.repository, pr.github_pr_number)
            .await
            .map_err(|e| JobError::Other(anyhow::Error::from(e)))?;

        if remote.status == PrStatus::Open {
            return Ok(());
        }

        tracing::info!(
            "PR #{} moved from open to {}, updating",
            pr.github_pr_number,
            remote.status
        );
        let update = PrStatusUpdate {
            merged_at: remote.merged_at,
            closed_at: remote.closed_at,
            merge_commit_sha: remote.merge_commit_sha.clone(),
            merged_by: remote.merged_by.clone(),
        };
        PullRequest::update_status(&self.db.pool, pr.id, remote.status, &update).await?;

        let task = Task::find_by_id(&self.db.pool, pr.task_id).await?;
        if remote.status == PrStatus::Merged
            && let Some(task) = &task
            && task.status != TaskStatus::Done
        {
            if let Err(e) = self.transition_task(task, TaskStatus::Done).await {
                tracing::error!("Failed to complete task {} after merge: {e}", task.id);
            }
        }

        if let Some(task) = task {
            let mut updated = pr.clone();
            updated.status = remote.status;
            updated.merged_at = update.merged_at;
            updated.closed_at = update.closed_at;
            updated.merge_commit_sha = update.merge_commit_sha;
            updated.merged_by = update.merged_by;
            self.notifier
                .pr_status_changed(task.project_id, &updated, PrStatus::Open, remote.status)
                .await;
        }
        Ok(())
    }
}
