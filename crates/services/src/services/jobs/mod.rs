use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use db::{
    DBService,
    models::{
        execution::{Execution as DbExecution, ExecutionStatus},
        job::Job,
        plan::Plan,
        task::{Task, TaskStatus},
    },
};
use executors::{
    executors::{AgentTask, AiType, CodingAgent, CodingAgentExecutor},
    logs::LogSource,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    execution::{Execution, ExecutionEngine},
    git::GitOps,
    github::{GithubPrClient, PrCreator},
    notify::NotificationService,
    queue::{EnqueueOptions, JobError, JobHandler, JobQueue, QueueError},
    worktree::WorktreeProvisioner,
};

pub mod implementation;
pub mod planning;
pub mod pr_sync;
pub mod worktree_cleanup;

pub const JOB_TASK_PLANNING: &str = "task:planning";
pub const JOB_TASK_IMPLEMENTATION: &str = "task:implementation";
pub const JOB_PR_STATUS_SYNC: &str = "pr:status_sync";
pub const JOB_WORKTREE_CLEANUP: &str = "worktree:cleanup";

pub const QUEUE_PLANNING: &str = "planning";
pub const QUEUE_IMPLEMENTATION: &str = "implementation";
pub const QUEUE_MONITORING: &str = "monitoring";

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlanningPayload {
    #[serde(default = "default_version")]
    pub version: u32,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub branch_name: String,
    pub ai_type: AiType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskImplementationPayload {
    #[serde(default = "default_version")]
    pub version: u32,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub ai_type: AiType,
}

/// Enqueue API consumed by the HTTP handlers.
pub async fn enqueue_task_planning(
    queue: &JobQueue,
    payload: &TaskPlanningPayload,
    delay: Option<Duration>,
) -> Result<Uuid, QueueError> {
    queue
        .enqueue(
            JOB_TASK_PLANNING,
            serde_json::to_value(payload)?,
            EnqueueOptions {
                queue: QUEUE_PLANNING.to_string(),
                max_retry: 1,
                timeout: Duration::from_secs(30 * 60),
                delay,
            },
        )
        .await
}

pub async fn enqueue_task_implementation(
    queue: &JobQueue,
    payload: &TaskImplementationPayload,
    delay: Option<Duration>,
) -> Result<Uuid, QueueError> {
    queue
        .enqueue(
            JOB_TASK_IMPLEMENTATION,
            serde_json::to_value(payload)?,
            EnqueueOptions {
                queue: QUEUE_IMPLEMENTATION.to_string(),
                max_retry: 1,
                timeout: Duration::from_secs(60 * 60),
                delay,
            },
        )
        .await
}

#[derive(Clone)]
pub struct ProcessorConfig {
    pub push_remote: String,
    pub worktree_retention: chrono::Duration,
    /// Hard ceilings on live executions; on expiry the execution context is
    /// cancelled, which kills the subprocess.
    pub planning_timeout: Duration,
    pub implementation_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            push_remote: "origin".to_string(),
            worktree_retention: chrono::Duration::days(7),
            planning_timeout: Duration::from_secs(30 * 60),
            implementation_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Job handlers for the task lifecycle. Holds the execution engine, the
/// notification façade and the external collaborators; every handler is
/// idempotent-safe by re-reading current task state before mutating.
#[derive(Clone)]
pub struct JobProcessor {
    pub(crate) db: DBService,
    pub(crate) engine: ExecutionEngine,
    pub(crate) notifier: NotificationService,
    pub(crate) git: Arc<dyn GitOps>,
    pub(crate) github: Arc<dyn GithubPrClient>,
    pub(crate) pr_creator: Arc<dyn PrCreator>,
    pub(crate) worktrees: Arc<dyn WorktreeProvisioner>,
    pub(crate) config: ProcessorConfig,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DBService,
        engine: ExecutionEngine,
        notifier: NotificationService,
        git: Arc<dyn GitOps>,
        github: Arc<dyn GithubPrClient>,
        pr_creator: Arc<dyn PrCreator>,
        worktrees: Arc<dyn WorktreeProvisioner>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            db,
            engine,
            notifier,
            git,
            github,
            pr_creator,
            worktrees,
            config,
        }
    }

    pub async fn register_handlers(&self, queue: &JobQueue) {
        queue
            .register_handler(JOB_TASK_PLANNING, Arc::new(PlanningHandler(self.clone())))
            .await;
        queue
            .register_handler(
                JOB_TASK_IMPLEMENTATION,
                Arc::new(ImplementationHandler(self.clone())),
            )
            .await;
        queue
            .register_handler(JOB_PR_STATUS_SYNC, Arc::new(PrStatusSyncHandler(self.clone())))
            .await;
        queue
            .register_handler(
                JOB_WORKTREE_CLEANUP,
                Arc::new(WorktreeCleanupHandler(self.clone())),
            )
            .await;
    }

    pub(crate) async fn fetch_task(&self, task_id: Uuid) -> Result<Task, JobError> {
        Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or_else(|| JobError::Validation(format!("task {task_id} not found")))
    }

    /// Validated, idempotent status transition. When the task is already in
    /// `next` nothing is written and no notification is emitted; an edge
    /// missing from the transition table is a validation error.
    pub async fn transition_task(
        &self,
        task: &Task,
        next: TaskStatus,
    ) -> Result<Task, JobError> {
        if task.status == next {
            return Ok(task.clone());
        }
        if !task.status.can_transition_to(next) {
            return Err(JobError::Validation(format!(
                "invalid task transition {} -> {next} for task {}",
                task.status, task.id
            )));
        }
        let old = task.status;
        Task::update_status(&self.db.pool, task.id, next).await?;
        let updated = self.fetch_task(task.id).await?;
        self.notifier.task_status_changed(&updated, old, next).await;
        Ok(updated)
    }

    /// Best-effort compensation: put the task back into `to`, logging instead
    /// of failing when the revert itself cannot proceed.
    pub(crate) async fn revert_task(&self, task_id: Uuid, to: TaskStatus) {
        match Task::find_by_id(&self.db.pool, task_id).await {
            Ok(Some(task)) => {
                if let Err(e) = self.transition_task(&task, to).await {
                    tracing::error!("Failed to revert task {task_id} to {to}: {e}");
                }
            }
            Ok(None) => tracing::error!("Cannot revert missing task {task_id}"),
            Err(e) => tracing::error!("Cannot revert task {task_id}: {e}"),
        }
    }

    pub(crate) fn agent_task(task: &Task, plan: Option<&Plan>) -> AgentTask {
        AgentTask {
            id: task.id,
            title: task.title.clone(),
            description: task.description.clone(),
            worktree_path: task.worktree_path.clone(),
            plan_content: plan.map(|p| p.content.clone()),
        }
    }

    /// Executions the database still thinks are live after a restart are
    /// failed and their tasks reverted to the predecessor state.
    pub async fn recover_orphan_executions(&self) -> Result<(), JobError> {
        for execution in DbExecution::find_unfinished(&self.db.pool).await? {
            tracing::info!(
                "Marking orphaned execution {} for task {} as failed",
                execution.id,
                execution.task_id
            );
            DbExecution::mark_failed(
                &self.db.pool,
                execution.id,
                Utc::now(),
                "orphaned at startup",
            )
            .await?;
            if let Ok(Some(task)) = Task::find_by_id(&self.db.pool, execution.task_id).await {
                let revert = match task.status {
                    TaskStatus::Planning => Some(TaskStatus::Todo),
                    TaskStatus::Implementing => Some(TaskStatus::PlanReviewing),
                    _ => None,
                };
                if let Some(to) = revert
                    && let Err(e) = self.transition_task(&task, to).await
                {
                    tracing::error!("Failed to revert orphaned task {}: {e}", task.id);
                }
            }
        }
        Ok(())
    }
}

pub struct PlanningHandler(pub JobProcessor);
pub struct ImplementationHandler(pub JobProcessor);
pub struct PrStatusSyncHandler(pub JobProcessor);
pub struct WorktreeCleanupHandler(pub JobProcessor);

#[async_trait]
impl JobHandler for PlanningHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.0.handle_task_planning(job).await
    }
}

#[async_trait]
impl JobHandler for ImplementationHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.0.handle_task_implementation(job).await
    }
}

#[async_trait]
impl JobHandler for PrStatusSyncHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.0.handle_pr_status_sync(job).await
    }
}

#[async_trait]
impl JobHandler for WorktreeCleanupHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.0.handle_worktree_cleanup(job).await
    }
}

/// Polls a live execution, persisting parsed log batches each second until
/// termination. The owning handler spawns one supervisor per execution and
/// returns, freeing its queue worker slot.
pub(crate) struct ExecutionSupervisor {
    pub processor: JobProcessor,
    pub execution: Arc<Execution>,
    pub agent: CodingAgent,
    pub project_id: Uuid,
    pub stdout_rx: mpsc::Receiver<String>,
    pub stderr_rx: mpsc::Receiver<String>,
    pub timeout: Duration,
}

impl ExecutionSupervisor {
    /// Runs to execution termination and returns the terminal status.
    pub async fn run(mut self) -> ExecutionStatus {
        let done = self.execution.done_token();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut next_line: i64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain(&mut next_line).await,
                _ = done.cancelled() => break,
                _ = &mut deadline => {
                    tracing::warn!(
                        "Execution {} exceeded its {}s timeout, cancelling",
                        self.execution.id,
                        self.timeout.as_secs()
                    );
                    if let Err(e) = self.processor.engine.cancel_execution(self.execution.id).await {
                        tracing::error!("Failed to cancel timed-out execution: {e}");
                    }
                    // Termination arrives via the done token.
                    deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + Duration::from_secs(86400));
                }
            }
        }
        // One last drain for chunks flushed between the final tick and exit.
        self.drain(&mut next_line).await;
        self.execution.status()
    }

    async fn drain(&mut self, next_line: &mut i64) {
        let mut entries = Vec::new();
        while let Ok(chunk) = self.stdout_rx.try_recv() {
            let parsed = self
                .agent
                .parse_output_to_logs(&chunk, LogSource::Stdout, *next_line);
            *next_line += parsed.len() as i64;
            entries.extend(parsed);
        }
        while let Ok(chunk) = self.stderr_rx.try_recv() {
            tracing::error!(
                "Execution {} stderr: {}",
                self.execution.id,
                chunk.trim_end()
            );
            let parsed = self
                .agent
                .parse_output_to_logs(&chunk, LogSource::Stderr, *next_line);
            *next_line += parsed.len() as i64;
            entries.extend(parsed);
        }
        if entries.is_empty() {
            return;
        }

        let line_count = entries.len();
        if let Err(e) = db::models::execution_log::ExecutionLog::batch_insert_or_update(
            &self.processor.db.pool,
            self.execution.id,
            &entries,
        )
        .await
        {
            tracing::error!(
                "Failed to persist {line_count} log lines for execution {}: {e}",
                self.execution.id
            );
            return;
        }
        if let Err(e) = DbExecution::update_progress(
            &self.processor.db.pool,
            self.execution.id,
            self.execution.progress(),
        )
        .await
        {
            tracing::error!("Failed to update execution progress: {e}");
        }
        self.processor
            .notifier
            .execution_logs_created(self.project_id, self.execution.id, line_count)
            .await;
    }
}
