use std::{path::Path, sync::Arc};

use chrono::Utc;
use db::models::{
    execution::{Execution as DbExecution, ExecutionStatus},
    job::Job,
    plan::Plan,
    project::Project,
    pull_request::{CreatePullRequest, PullRequest},
    task::{GitStatus, Task, TaskStatus},
};
use executors::executors::CodingAgent;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ExecutionSupervisor, JobProcessor, TaskImplementationPayload};
use crate::services::{
    execution::{Execution, ExecutionError, ExecutionMode},
    queue::JobError,
};

fn commit_message(task: &Task) -> String {
    let description = task.description.as_deref().unwrap_or_default();
    format!(
        "Implement task: {}\n\nTask ID: {}\n\n{}",
        task.title, task.id, description
    )
    .trim_end()
    .to_string()
}

impl JobProcessor {
    /// `task:implementation`: run the coding agent against the approved (or
    /// reviewing) plan, then open a PR and move the task to `CODE_REVIEWING`.
    pub async fn handle_task_implementation(&self, job: &Job) -> Result<(), JobError> {
        let payload: TaskImplementationPayload = serde_json::from_value(job.payload.0.clone())
            .map_err(|e| JobError::Validation(format!("bad task:implementation payload: {e}")))?;

        let task = self.fetch_task(payload.task_id).await?;
        let task = if task.status == TaskStatus::Implementing {
            task
        } else {
            self.transition_task(&task, TaskStatus::Implementing).await?
        };

        if task
            .worktree_path
            .as_deref()
            .is_none_or(|p| p.is_empty())
            || task.branch_name.as_deref().is_none_or(|b| b.is_empty())
        {
            self.revert_task(task.id, TaskStatus::PlanReviewing).await;
            return Err(JobError::Validation(format!(
                "task {} has no worktree or branch; run planning first",
                task.id
            )));
        }

        let plan = match Plan::find_latest_by_task_id(&self.db.pool, task.id).await? {
            Some(plan) if plan.status.allows_implementation() => plan,
            Some(plan) => {
                self.revert_task(task.id, TaskStatus::PlanReviewing).await;
                return Err(JobError::Validation(format!(
                    "plan {} is {:?}; needs approval before implementation",
                    plan.id, plan.status
                )));
            }
            None => {
                self.revert_task(task.id, TaskStatus::PlanReviewing).await;
                return Err(JobError::Validation(format!(
                    "task {} has no plan to implement",
                    task.id
                )));
            }
        };

        let agent = CodingAgent::from_ai_type(payload.ai_type);
        let agent_task = Self::agent_task(&task, Some(&plan));
        let execution = match self
            .engine
            .start_execution(&agent_task, &agent, ExecutionMode::Implementation)
            .await
        {
            Ok(execution) => execution,
            // A redelivered job racing a live execution must not disturb it.
            Err(ExecutionError::AlreadyRunning(task_id)) => {
                return Err(JobError::Validation(format!(
                    "task {task_id} already has a live execution"
                )));
            }
            Err(e) => {
                self.revert_task(task.id, TaskStatus::PlanReviewing).await;
                return Err(e.into());
            }
        };

        if let Err(e) = DbExecution::create(&self.db.pool, task.id, execution.id).await {
            let _ = self.engine.cancel_execution(execution.id).await;
            self.revert_task(task.id, TaskStatus::PlanReviewing).await;
            return Err(e.into());
        }

        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        self.engine.register_stdout_channel(&execution, stdout_tx);
        self.engine.register_stderr_channel(&execution, stderr_tx);

        if let Err(e) = self.engine.run_execution(execution.clone()).await {
            DbExecution::mark_failed(&self.db.pool, execution.id, Utc::now(), &e.to_string())
                .await?;
            self.revert_task(task.id, TaskStatus::PlanReviewing).await;
            return Err(e.into());
        }

        let processor = self.clone();
        let task_id = task.id;
        let supervisor = ExecutionSupervisor {
            processor: self.clone(),
            execution: execution.clone(),
            agent,
            project_id: task.project_id,
            stdout_rx,
            stderr_rx,
            timeout: self.config.implementation_timeout,
        };
        tokio::spawn(async move {
            let status = supervisor.run().await;
            processor
                .finalize_implementation(task_id, execution, plan, status)
                .await;
        });
        Ok(())
    }

    async fn finalize_implementation(
        &self,
        task_id: Uuid,
        execution: Arc<Execution>,
        plan: Plan,
        status: ExecutionStatus,
    ) {
        let completed_at = execution.completed_at().unwrap_or_else(Utc::now);
        if status != ExecutionStatus::Completed {
            let error = execution
                .error()
                .unwrap_or_else(|| format!("execution ended as {status:?}"));
            if let Err(e) =
                DbExecution::mark_failed(&self.db.pool, execution.id, completed_at, &error).await
            {
                tracing::error!("Failed to mark execution {} failed: {e}", execution.id);
            }
            self.revert_task(task_id, TaskStatus::PlanReviewing).await;
            return;
        }

        let result = execution.result().unwrap_or_default();
        if let Err(e) =
            DbExecution::mark_completed(&self.db.pool, execution.id, completed_at, &result).await
        {
            tracing::error!("Failed to mark execution {} completed: {e}", execution.id);
        }

        // Move to review first so the PR, once it exists, always points at a
        // task at or beyond code_reviewing. PR failures don't undo this.
        let task = match self.fetch_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!("Lost task {task_id} after implementation: {e}");
                return;
            }
        };
        let task = match self.transition_task(&task, TaskStatus::CodeReviewing).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!("Failed to move task {task_id} to code_reviewing: {e}");
                return;
            }
        };

        self.run_pr_workflow(&task, Some(&plan)).await;
    }

    /// Commit pending worktree changes, push, and open a PR. Every step is
    /// best-effort: a push or PR failure leaves the task in review and is
    /// reconciled later by the status-sync loop.
    pub(crate) async fn run_pr_workflow(&self, task: &Task, plan: Option<&Plan>) {
        let project = match Project::find_by_id(&self.db.pool, task.project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                tracing::error!("Project {} missing, skipping PR workflow", task.project_id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load project for PR workflow: {e}");
                return;
            }
        };
        let Some(repository) = project.repository_slug() else {
            tracing::error!(
                "Repository URL {} is not a GitHub repo, skipping PR workflow",
                project.repository_url
            );
            return;
        };
        let (Some(worktree_path), Some(branch_name)) = (&task.worktree_path, &task.branch_name)
        else {
            tracing::error!("Task {} lost its worktree before PR creation", task.id);
            return;
        };

        match self.git.has_pending_changes(Path::new(worktree_path)).await {
            Ok(true) => {
                let message = commit_message(task);
                match self
                    .git
                    .commit_and_push(
                        Path::new(worktree_path),
                        &message,
                        &self.config.push_remote,
                        branch_name,
                    )
                    .await
                {
                    Ok(()) => {
                        if let Err(e) =
                            Task::update_git_status(&self.db.pool, task.id, GitStatus::Clean).await
                        {
                            tracing::error!("Failed to update git status: {e}");
                        }
                    }
                    Err(e) => {
                        // A previously pushed commit may still make PR creation
                        // possible, so the workflow continues.
                        tracing::error!(
                            "Commit/push failed for task {}, continuing: {e}",
                            task.id
                        );
                    }
                }
            }
            Ok(false) => tracing::debug!("No pending changes for task {}", task.id),
            Err(e) => tracing::error!("Pending-change check failed for task {}: {e}", task.id),
        }

        match self
            .pr_creator
            .create_from_implementation(&repository, task, plan)
            .await
        {
            Ok(created) => {
                let create = CreatePullRequest {
                    task_id: task.id,
                    repository: created.repository.clone(),
                    github_pr_number: created.number,
                };
                match PullRequest::create(&self.db.pool, &create, Uuid::new_v4()).await {
                    Ok(pr) => self.notifier.pr_created(task.project_id, &pr).await,
                    Err(e) => {
                        // The PR exists on GitHub; losing the local row is
                        // recovered by the operator, not rolled back.
                        tracing::error!(
                            "Failed to persist PR #{} for task {}: {e}",
                            created.number,
                            task.id
                        );
                    }
                }
            }
            Err(e) => tracing::error!("PR creation failed for task {}: {e}", task.id),
        }
    }
}
