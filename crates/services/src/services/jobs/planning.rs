use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use db::models::{
    execution::{Execution as DbExecution, ExecutionStatus},
    job::Job,
    plan::{Plan, PlanStatus},
    project::Project,
    task::TaskStatus,
};
use executors::executors::{CodingAgent, CodingAgentExecutor};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ExecutionSupervisor, JobProcessor, TaskPlanningPayload};
use crate::services::{
    execution::{Execution, ExecutionError, ExecutionMode},
    queue::JobError,
    worktree::WorktreeRequest,
};

impl JobProcessor {
    /// `task:planning`: drive a task through a planning run, ending in
    /// `PLAN_REVIEWING` with a reviewable plan, or back in `TODO` on failure.
    pub async fn handle_task_planning(&self, job: &Job) -> Result<(), JobError> {
        let payload: TaskPlanningPayload = serde_json::from_value(job.payload.0.clone())
            .map_err(|e| JobError::Validation(format!("bad task:planning payload: {e}")))?;

        let task = self.fetch_task(payload.task_id).await?;

        // Idempotent re-entry: a redelivered job finds the task already in
        // PLANNING and just continues.
        let task = if task.status == TaskStatus::Planning {
            task
        } else {
            self.transition_task(&task, TaskStatus::Planning).await?
        };

        let project = match Project::find_by_id(&self.db.pool, payload.project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                self.revert_task(task.id, TaskStatus::Todo).await;
                return Err(JobError::Validation(format!(
                    "project {} not found",
                    payload.project_id
                )));
            }
            Err(e) => {
                self.revert_task(task.id, TaskStatus::Todo).await;
                return Err(e.into());
            }
        };

        // An existing worktree is reused as-is; only tasks without one get a
        // fresh worktree and branch.
        let task = if task
            .worktree_path
            .as_deref()
            .is_none_or(|p| p.is_empty())
        {
            let request = WorktreeRequest {
                task_id: task.id,
                project_id: project.id,
                task_title: task.title.clone(),
                worktree_base_path: PathBuf::from(&project.worktree_base_path),
                repository_url: project.repository_url.clone(),
            };
            match self.worktrees.create_worktree_for_task(&request).await {
                Ok(provisioned) => {
                    db::models::task::Task::update_worktree(
                        &self.db.pool,
                        task.id,
                        &provisioned.branch_name,
                        &provisioned.worktree_path.to_string_lossy(),
                    )
                    .await?;
                    let updated = self.fetch_task(task.id).await?;
                    self.notifier
                        .task_updated(
                            &updated,
                            json!({
                                "branch_name": updated.branch_name,
                                "worktree_path": updated.worktree_path,
                            }),
                        )
                        .await;
                    updated
                }
                Err(e) => {
                    self.revert_task(task.id, TaskStatus::Todo).await;
                    return Err(JobError::Other(anyhow::anyhow!(
                        "worktree creation failed: {e}"
                    )));
                }
            }
        } else {
            task
        };

        let agent = CodingAgent::from_ai_type(payload.ai_type);
        let agent_task = Self::agent_task(&task, None);
        let execution = match self
            .engine
            .start_execution(&agent_task, &agent, ExecutionMode::Planning)
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
                self.revert_task(task.id, TaskStatus::Todo).await;
                return Err(e.into());
            }
        };

        // DB-side mirror of the in-memory execution, sharing its id.
        if let Err(e) = DbExecution::create(&self.db.pool, task.id, execution.id).await {
            let _ = self.engine.cancel_execution(execution.id).await;
            self.revert_task(task.id, TaskStatus::Todo).await;
            return Err(e.into());
        }

        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        self.engine.register_stdout_channel(&execution, stdout_tx);
        self.engine.register_stderr_channel(&execution, stderr_tx);

        if let Err(e) = self.engine.run_execution(execution.clone()).await {
            DbExecution::mark_failed(&self.db.pool, execution.id, Utc::now(), &e.to_string())
                .await?;
            self.revert_task(task.id, TaskStatus::Todo).await;
            return Err(e.into());
        }

        // The supervisor completes the flow in the background; returning here
        // frees the queue worker slot.
        let processor = self.clone();
        let project_id = task.project_id;
        let task_id = task.id;
        let supervisor = ExecutionSupervisor {
            processor: self.clone(),
            execution: execution.clone(),
            agent: agent.clone(),
            project_id,
            stdout_rx,
            stderr_rx,
            timeout: self.config.planning_timeout,
        };
        tokio::spawn(async move {
            let status = supervisor.run().await;
            processor
                .finalize_planning(task_id, execution, agent, status)
                .await;
        });
        Ok(())
    }

    async fn finalize_planning(
        &self,
        task_id: Uuid,
        execution: Arc<Execution>,
        agent: CodingAgent,
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
            self.revert_task(task_id, TaskStatus::Todo).await;
            return;
        }

        let result = execution.result().unwrap_or_default();
        if let Err(e) =
            DbExecution::mark_completed(&self.db.pool, execution.id, completed_at, &result).await
        {
            tracing::error!("Failed to mark execution {} completed: {e}", execution.id);
        }

        let markdown = match agent.parse_output_to_plan(&result.output) {
            Ok(markdown) => markdown,
            Err(e) => {
                tracing::error!(
                    "Planning for task {task_id} produced no usable plan: {e}"
                );
                self.revert_task(task_id, TaskStatus::Todo).await;
                return;
            }
        };

        let plan = match Plan::create(&self.db.pool, task_id, &markdown, Uuid::new_v4()).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("Failed to persist plan for task {task_id}: {e}");
                self.revert_task(task_id, TaskStatus::Todo).await;
                return;
            }
        };
        if let Err(e) = Plan::update_status(&self.db.pool, plan.id, PlanStatus::Reviewing).await {
            tracing::error!("Failed to move plan {} to reviewing: {e}", plan.id);
        }

        match self.fetch_task(task_id).await {
            Ok(task) => {
                if let Err(e) = self.transition_task(&task, TaskStatus::PlanReviewing).await {
                    tracing::error!("Failed to move task {task_id} to plan_reviewing: {e}");
                }
            }
            Err(e) => tracing::error!("Lost task {task_id} after planning: {e}"),
        }
    }
}
