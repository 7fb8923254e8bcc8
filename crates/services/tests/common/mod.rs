use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        plan::Plan,
        project::{CreateProject, Project},
        task::{CreateTask, Task, TaskStatus},
    },
};
use executors::executors::AiType;
use services::services::{
    execution::ExecutionEngine,
    git::{GitError, GitOps},
    github::{CreatedPr, GitHubServiceError, GithubPrClient, PrCreator, RemotePrStatus},
    hub::{Connection, Hub},
    jobs::{JobProcessor, ProcessorConfig},
    message::{Envelope, MessageType},
    notify::NotificationService,
    process_manager::ProcessManager,
    worktree::{ProvisionedWorktree, WorktreeError, WorktreeProvisioner, WorktreeRequest},
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Git stub: records mutating calls, never touches a repository.
#[derive(Default)]
pub struct StubGit {
    pub pending_changes: AtomicBool,
    pub commits: Mutex<Vec<String>>,
    pub deleted_worktrees: Mutex<Vec<PathBuf>>,
    pub deleted_branches: Mutex<Vec<String>>,
}

#[async_trait]
impl GitOps for StubGit {
    async fn has_pending_changes(&self, _path: &Path) -> Result<bool, GitError> {
        Ok(self.pending_changes.load(Ordering::SeqCst))
    }

    async fn commit_and_push(
        &self,
        _path: &Path,
        message: &str,
        _remote: &str,
        _branch: &str,
    ) -> Result<(), GitError> {
        self.commits.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn delete_worktree(
        &self,
        _working_dir: &Path,
        worktree_path: &Path,
    ) -> Result<(), GitError> {
        self.deleted_worktrees
            .lock()
            .unwrap()
            .push(worktree_path.to_path_buf());
        Ok(())
    }

    async fn delete_branch(
        &self,
        _working_dir: &Path,
        name: &str,
        _force: bool,
    ) -> Result<(), GitError> {
        self.deleted_branches.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// GitHub read stub: hands back whatever the test primed it with.
#[derive(Default)]
pub struct StubGithub {
    pub remote: Mutex<Option<RemotePrStatus>>,
}

#[async_trait]
impl GithubPrClient for StubGithub {
    async fn get_pull_request(
        &self,
        _repository: &str,
        number: i64,
    ) -> Result<RemotePrStatus, GitHubServiceError> {
        self.remote
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GitHubServiceError::PullRequest(format!("no stub for PR #{number}")))
    }
}

pub struct StubPrCreator {
    pub number: i64,
    pub fail: AtomicBool,
}

impl Default for StubPrCreator {
    fn default() -> Self {
        Self {
            number: 42,
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PrCreator for StubPrCreator {
    async fn create_from_implementation(
        &self,
        repository: &str,
        _task: &Task,
        _plan: Option<&Plan>,
    ) -> Result<CreatedPr, GitHubServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GitHubServiceError::PullRequest("stubbed failure".into()));
        }
        Ok(CreatedPr {
            repository: repository.to_string(),
            number: self.number,
            url: format!("https://github.com/{repository}/pull/{}", self.number),
        })
    }
}

/// Worktree stub: makes a real directory under the test's base path so
/// executions have somewhere to run.
pub struct StubWorktrees;

#[async_trait]
impl WorktreeProvisioner for StubWorktrees {
    async fn create_worktree_for_task(
        &self,
        request: &WorktreeRequest,
    ) -> Result<ProvisionedWorktree, WorktreeError> {
        let worktree_path = request
            .worktree_base_path
            .join(format!("wt-{}", request.task_id.simple()));
        tokio::fs::create_dir_all(&worktree_path).await?;
        Ok(ProvisionedWorktree {
            branch_name: format!("df/test-{}", utils::text::short_uuid(&request.task_id)),
            worktree_path,
        })
    }
}

pub struct TestHarness {
    pub db: DBService,
    pub hub: Hub,
    pub processor: JobProcessor,
    pub git: Arc<StubGit>,
    pub github: Arc<StubGithub>,
    pub pr_creator: Arc<StubPrCreator>,
    pub tmp: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(ProcessorConfig::default()).await
    }

    pub async fn with_config(config: ProcessorConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("devflow-test.sqlite");
        let db = DBService::new(&format!("sqlite://{}", db_path.display()))
            .await
            .unwrap();

        let hub = Hub::new();
        let notifier = NotificationService::new(hub.clone(), None, "test-worker");
        let engine = ExecutionEngine::new(ProcessManager::new());
        let git = Arc::new(StubGit::default());
        let github = Arc::new(StubGithub::default());
        let pr_creator = Arc::new(StubPrCreator::default());

        let processor = JobProcessor::new(
            db.clone(),
            engine,
            notifier,
            git.clone(),
            github.clone(),
            pr_creator.clone(),
            Arc::new(StubWorktrees),
            config,
        );

        Self {
            db,
            hub,
            processor,
            git,
            github,
            pr_creator,
            tmp,
        }
    }

    pub async fn create_project(&self) -> Project {
        Project::create(
            &self.db.pool,
            &CreateProject {
                worktree_base_path: self.tmp.path().join("worktrees").display().to_string(),
                repository_url: "https://github.com/acme/widget.git".to_string(),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap()
    }

    pub async fn create_task(
        &self,
        project: &Project,
        description: Option<&str>,
        status: TaskStatus,
    ) -> Task {
        let task = Task::create(
            &self.db.pool,
            &CreateTask {
                project_id: project.id,
                title: "Fix login flow".to_string(),
                description: description.map(String::from),
                priority: 0,
                ai_type: AiType::FakeCode,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        if status != TaskStatus::Todo {
            Task::update_status(&self.db.pool, task.id, status)
                .await
                .unwrap();
        }
        Task::find_by_id(&self.db.pool, task.id).await.unwrap().unwrap()
    }

    /// Give a task a real (empty) worktree directory plus a branch name.
    pub async fn attach_worktree(&self, task: &Task) -> Task {
        let worktree = self.tmp.path().join(format!("wt-{}", task.id.simple()));
        tokio::fs::create_dir_all(&worktree).await.unwrap();
        Task::update_worktree(
            &self.db.pool,
            task.id,
            "df/test-branch",
            &worktree.display().to_string(),
        )
        .await
        .unwrap();
        Task::find_by_id(&self.db.pool, task.id).await.unwrap().unwrap()
    }

    /// Register a hub connection subscribed to `project_id`.
    pub async fn subscribe(&self, project_id: Uuid) -> mpsc::Receiver<Envelope> {
        let (conn, rx) = Connection::channel();
        self.hub.register(conn.clone()).await;
        self.hub.subscribe(conn.id, project_id).await;
        rx
    }

    pub async fn wait_for_task_status(&self, task_id: Uuid, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let task = Task::find_by_id(&self.db.pool, task_id)
                .await
                .unwrap()
                .unwrap();
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} never reached {status} (currently {})",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Drain `rx` until a message of `message_type` arrives or the timeout hits.
pub async fn recv_message(
    rx: &mut mpsc::Receiver<Envelope>,
    message_type: MessageType,
    timeout: Duration,
) -> Option<Envelope> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(envelope)) if envelope.message_type == message_type => return Some(envelope),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Wrap a payload in a Job row so handlers can be driven directly.
pub async fn make_job(
    db: &DBService,
    job_type: &str,
    payload: serde_json::Value,
) -> db::models::job::Job {
    db::models::job::Job::create(
        &db.pool,
        &db::models::job::CreateJob {
            job_type: job_type.to_string(),
            queue: "default".to_string(),
            payload,
            max_retries: 0,
            timeout_seconds: 600,
            scheduled_at: chrono::Utc::now(),
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap()
}
