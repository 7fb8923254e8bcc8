use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use db::models::execution::{ExecutionResult, ExecutionStatus};
use executors::{
    command::CommandSpec,
    executors::{AgentTask, CodingAgent, CodingAgentExecutor, ExecutorError},
};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use utils::{procout::OutputSource, text::tail_lines};
use uuid::Uuid;

use super::process_manager::{ProcessError, ProcessManager, ProcessStatus};

/// How often accumulated output is pushed to registered consumers.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period between process exit and the terminal state, so downstream
/// consumers can flush their last log batch.
const COMPLETION_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Task {0} has no worktree path")]
    MissingWorktree(Uuid),
    #[error("Task {0} already has a running execution")]
    AlreadyRunning(Uuid),
    #[error("Execution {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Planning,
    Implementation,
}

/// One supervised run of a task's agent command in its worktree.
///
/// The supervisor task spawned by `run_execution` is the sole writer while
/// the execution is live; everyone else reads through the accessors.
pub struct Execution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub mode: ExecutionMode,
    pub command: CommandSpec,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    status: StdRwLock<ExecutionStatus>,
    progress: StdRwLock<f64>,
    completed_at: StdRwLock<Option<DateTime<Utc>>>,
    result: StdRwLock<Option<ExecutionResult>>,
    error: StdRwLock<Option<String>>,
    stdout_tx: StdMutex<Option<mpsc::Sender<String>>>,
    stderr_tx: StdMutex<Option<mpsc::Sender<String>>>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Execution {
    pub fn status(&self) -> ExecutionStatus {
        *self.status.read().unwrap()
    }

    pub fn progress(&self) -> f64 {
        *self.progress.read().unwrap()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read().unwrap()
    }

    pub fn result(&self) -> Option<ExecutionResult> {
        self.result.read().unwrap().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap().clone()
    }

    /// Cancelled when the execution terminates for any reason.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    fn set_status(&self, status: ExecutionStatus) {
        *self.status.write().unwrap() = status;
    }

    /// Monotonic: lower estimates than the current value are ignored.
    fn bump_progress(&self, value: f64) {
        let mut progress = self.progress.write().unwrap();
        if value > *progress {
            *progress = value.clamp(0.0, 1.0);
        }
    }

    fn stdout_sender(&self) -> Option<mpsc::Sender<String>> {
        self.stdout_tx.lock().unwrap().clone()
    }

    fn stderr_sender(&self) -> Option<mpsc::Sender<String>> {
        self.stderr_tx.lock().unwrap().clone()
    }
}

/// Keyword heuristic mapping output chunks to a progress estimate. UI hint
/// only; the execution status is authoritative.
fn estimate_progress(chunk: &str) -> Option<f64> {
    let lower = chunk.to_lowercase();
    if lower.contains("completed") || lower.contains("done") {
        Some(1.0)
    } else if lower.contains("processing") || lower.contains("running") {
        Some(0.5)
    } else if lower.contains("starting") || lower.contains("initializing") {
        Some(0.2)
    } else {
        None
    }
}

/// Registry of live executions on top of the process supervisor.
#[derive(Clone, Default)]
pub struct ExecutionEngine {
    processes: ProcessManager,
    executions: Arc<RwLock<HashMap<Uuid, Arc<Execution>>>>,
}

impl ExecutionEngine {
    pub fn new(processes: ProcessManager) -> Self {
        Self {
            processes,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve the agent command for `task` and register a pending execution.
    /// Never blocks on the process; `run_execution` starts it.
    pub async fn start_execution(
        &self,
        task: &AgentTask,
        agent: &CodingAgent,
        mode: ExecutionMode,
    ) -> Result<Arc<Execution>, ExecutionError> {
        let work_dir = task
            .worktree_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ExecutionError::MissingWorktree(task.id))?;

        let command = match mode {
            ExecutionMode::Planning => agent.planning_command(task)?,
            ExecutionMode::Implementation => agent.implementation_command(task)?,
        };

        let mut executions = self.executions.write().await;
        if executions
            .values()
            .any(|e| e.task_id == task.id && !e.status().is_terminal())
        {
            return Err(ExecutionError::AlreadyRunning(task.id));
        }

        let execution = Arc::new(Execution {
            id: Uuid::new_v4(),
            task_id: task.id,
            mode,
            command,
            work_dir: PathBuf::from(work_dir),
            started_at: Utc::now(),
            status: StdRwLock::new(ExecutionStatus::Pending),
            progress: StdRwLock::new(0.0),
            completed_at: StdRwLock::new(None),
            result: StdRwLock::new(None),
            error: StdRwLock::new(None),
            stdout_tx: StdMutex::new(None),
            stderr_tx: StdMutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    /// The engine pushes accumulated-since-last-poll stdout chunks into `tx`
    /// at the output poll cadence. The consumer must drain.
    pub fn register_stdout_channel(&self, execution: &Execution, tx: mpsc::Sender<String>) {
        *execution.stdout_tx.lock().unwrap() = Some(tx);
    }

    pub fn register_stderr_channel(&self, execution: &Execution, tx: mpsc::Sender<String>) {
        *execution.stderr_tx.lock().unwrap() = Some(tx);
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Execution>> {
        self.executions.read().await.get(&id).cloned()
    }

    /// Cancel the execution context; the kill propagates to the subprocess.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<(), ExecutionError> {
        let execution = self.get(id).await.ok_or(ExecutionError::NotFound(id))?;
        execution.cancel.cancel();
        // A pending execution has no supervisor to observe the cancel, so it
        // is settled and reaped here.
        if execution.status() == ExecutionStatus::Pending {
            execution.set_status(ExecutionStatus::Cancelled);
            *execution.completed_at.write().unwrap() = Some(Utc::now());
            execution.done.cancel();
            self.executions.write().await.remove(&id);
        }
        Ok(())
    }

    /// Transition to running, spawn the subprocess and the supervisor task,
    /// and return immediately.
    pub async fn run_execution(&self, execution: Arc<Execution>) -> Result<(), ExecutionError> {
        execution.set_status(ExecutionStatus::Running);

        let process = match self
            .processes
            .spawn(
                &execution.command.command,
                &execution.work_dir,
                execution.command.stdin.as_deref(),
            )
            .await
        {
            Ok(process) => process,
            Err(e) => {
                execution.set_status(ExecutionStatus::Failed);
                *execution.error.write().unwrap() = Some(e.to_string());
                *execution.completed_at.write().unwrap() = Some(Utc::now());
                execution.done.cancel();
                self.executions.write().await.remove(&execution.id);
                return Err(e.into());
            }
        };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.supervise(execution, process).await;
        });
        Ok(())
    }

    /// Pump output to consumers until the process exits or the execution is
    /// cancelled, then settle the terminal state and reap the registry entry.
    async fn supervise(
        &self,
        execution: Arc<Execution>,
        process: Arc<super::process_manager::ProcessHandle>,
    ) {
        let process_done = process.done_token();
        let mut stdout_offset = 0usize;
        let mut stderr_offset = 0usize;
        let mut ticker = tokio::time::interval(OUTPUT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let cancelled = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::flush_output(&execution, &process, &mut stdout_offset, &mut stderr_offset).await;
                }
                _ = process_done.cancelled() => break false,
                _ = execution.cancel.cancelled() => break true,
            }
        };

        if cancelled {
            if let Err(e) = self.processes.kill(process.id).await {
                tracing::debug!("Kill after cancel for execution {}: {e}", execution.id);
            }
            execution.set_status(ExecutionStatus::Cancelled);
            *execution.completed_at.write().unwrap() = Some(Utc::now());
        } else {
            // Push whatever arrived between the last tick and process exit.
            Self::flush_output(&execution, &process, &mut stdout_offset, &mut stderr_offset).await;

            // Let downstream consumers flush their final log batch.
            tokio::time::sleep(COMPLETION_SETTLE).await;

            let completed_at = Utc::now();
            *execution.completed_at.write().unwrap() = Some(completed_at);

            match (process.status(), process.exit_code()) {
                (ProcessStatus::Stopped, Some(0)) => {
                    let result = ExecutionResult {
                        output: process.output().stdout_snapshot(),
                        files: Vec::new(),
                        metrics: serde_json::Map::new(),
                        duration_ms: (completed_at - execution.started_at).num_milliseconds(),
                    };
                    *execution.result.write().unwrap() = Some(result);
                    execution.bump_progress(1.0);
                    execution.set_status(ExecutionStatus::Completed);
                }
                (status, exit_code) => {
                    let stderr_tail = tail_lines(&process.output().stderr_snapshot(), 20);
                    let message = match exit_code {
                        Some(code) => format!("process exited with code {code}: {stderr_tail}"),
                        None => format!("process ended without exit code ({status:?}): {stderr_tail}"),
                    };
                    *execution.error.write().unwrap() = Some(message);
                    execution.set_status(ExecutionStatus::Failed);
                }
            }
        }

        execution.done.cancel();
        self.executions.write().await.remove(&execution.id);
    }

    async fn flush_output(
        execution: &Execution,
        process: &super::process_manager::ProcessHandle,
        stdout_offset: &mut usize,
        stderr_offset: &mut usize,
    ) {
        let (chunk, offset) = process.output().since(OutputSource::Stdout, *stdout_offset);
        *stdout_offset = offset;
        if !chunk.is_empty() {
            if let Some(value) = estimate_progress(&chunk) {
                execution.bump_progress(value);
            }
            if let Some(tx) = execution.stdout_sender() {
                let _ = tx.send(chunk).await;
            }
        }

        let (chunk, offset) = process.output().since(OutputSource::Stderr, *stderr_offset);
        *stderr_offset = offset;
        if !chunk.is_empty()
            && let Some(tx) = execution.stderr_sender()
        {
            let _ = tx.send(chunk).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_task(work_dir: &std::path::Path) -> AgentTask {
        AgentTask {
            id: Uuid::new_v4(),
            title: "demo".into(),
            description: None,
            worktree_path: Some(work_dir.to_string_lossy().into_owned()),
            plan_content: None,
        }
    }

    fn fake_agent() -> CodingAgent {
        CodingAgent::from_ai_type(executors::executors::AiType::FakeCode)
    }

    #[test]
    fn progress_estimates_follow_keywords() {
        assert_eq!(estimate_progress("Starting work"), Some(0.2));
        assert_eq!(estimate_progress("Processing task context"), Some(0.5));
        assert_eq!(estimate_progress("all Done"), Some(1.0));
        assert_eq!(estimate_progress("nothing to see"), None);
    }

    #[tokio::test]
    async fn execution_completes_with_result_and_monotonic_progress() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(ProcessManager::new());
        let task = agent_task(dir.path());

        let execution = engine
            .start_execution(&task, &fake_agent(), ExecutionMode::Planning)
            .await
            .unwrap();
        assert_eq!(execution.status(), ExecutionStatus::Pending);

        let (tx, mut rx) = mpsc::channel(16);
        engine.register_stdout_channel(&execution, tx);
        engine.run_execution(execution.clone()).await.unwrap();

        let mut seen = Vec::new();
        let mut progress = Vec::new();
        let done = execution.done_token();
        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    if let Some(chunk) = chunk {
                        progress.push(execution.progress());
                        seen.push(chunk);
                    }
                }
                _ = done.cancelled() => break,
            }
        }
        // Chunks buffered when the done token won the select race.
        while let Ok(chunk) = rx.try_recv() {
            progress.push(execution.progress());
            seen.push(chunk);
        }

        assert_eq!(execution.status(), ExecutionStatus::Completed);
        let result = execution.result().unwrap();
        assert!(result.output.contains("## Plan"));
        assert!(result.duration_ms >= 0);
        assert!(seen.concat().contains("Starting work"));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        // Terminal executions are reaped from the registry.
        assert!(engine.get(execution.id).await.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(ProcessManager::new());
        let mut task = agent_task(dir.path());
        task.description = Some(format!("x {}", executors::executors::fake::FAIL_MARKER));

        let execution = engine
            .start_execution(&task, &fake_agent(), ExecutionMode::Planning)
            .await
            .unwrap();
        engine.run_execution(execution.clone()).await.unwrap();
        execution.done_token().cancelled().await;

        assert_eq!(execution.status(), ExecutionStatus::Failed);
        let error = execution.error().unwrap();
        assert!(error.contains("code 1"));
        assert!(error.contains("fake agent failure"));
    }

    #[tokio::test]
    async fn second_execution_for_same_task_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(ProcessManager::new());
        let task = agent_task(dir.path());

        let _first = engine
            .start_execution(&task, &fake_agent(), ExecutionMode::Planning)
            .await
            .unwrap();
        assert!(matches!(
            engine
                .start_execution(&task, &fake_agent(), ExecutionMode::Planning)
                .await,
            Err(ExecutionError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn cancel_kills_the_process_and_sets_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(ProcessManager::new());
        let task = agent_task(dir.path());

        // A long-running command, registered by hand so the cancel races nothing.
        let execution = Arc::new(Execution {
            id: Uuid::new_v4(),
            task_id: task.id,
            mode: ExecutionMode::Planning,
            command: CommandSpec::new("sleep 30"),
            work_dir: dir.path().to_path_buf(),
            started_at: Utc::now(),
            status: StdRwLock::new(ExecutionStatus::Pending),
            progress: StdRwLock::new(0.0),
            completed_at: StdRwLock::new(None),
            result: StdRwLock::new(None),
            error: StdRwLock::new(None),
            stdout_tx: StdMutex::new(None),
            stderr_tx: StdMutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        engine
            .executions
            .write()
            .await
            .insert(execution.id, execution.clone());

        engine.run_execution(execution.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.cancel_execution(execution.id).await.unwrap();
        execution.done_token().cancelled().await;

        assert_eq!(execution.status(), ExecutionStatus::Cancelled);
        assert!(execution.completed_at().is_some());
    }
}
