use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use utils::text::{git_branch_id, short_uuid};
use uuid::Uuid;

use super::git::{GitError, run_git};

// Serialize creation per worktree path; concurrent planning re-runs for the
// same task must not race git's worktree metadata.
lazy_static::lazy_static! {
    static ref WORKTREE_CREATION_LOCKS: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorktreeRequest {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub task_title: String,
    pub worktree_base_path: PathBuf,
    pub repository_url: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionedWorktree {
    pub branch_name: String,
    pub worktree_path: PathBuf,
}

#[async_trait]
pub trait WorktreeProvisioner: Send + Sync {
    async fn create_worktree_for_task(
        &self,
        request: &WorktreeRequest,
    ) -> Result<ProvisionedWorktree, WorktreeError>;
}

/// The project's backing clone, shared by all of its worktrees.
pub fn project_repo_dir(worktree_base_path: &Path) -> PathBuf {
    worktree_base_path.join(".repo")
}

pub fn branch_name_for_task(task_id: &Uuid, task_title: &str) -> String {
    let slug = git_branch_id(task_title);
    if slug.is_empty() {
        format!("df/{}", short_uuid(task_id))
    } else {
        format!("df/{}-{}", short_uuid(task_id), slug)
    }
}

pub fn dir_name_for_task(task_id: &Uuid, task_title: &str) -> String {
    let slug = git_branch_id(task_title);
    if slug.is_empty() {
        format!("df-{}", short_uuid(task_id))
    } else {
        format!("df-{}-{}", short_uuid(task_id), slug)
    }
}

/// Provisions one git worktree per task under the project's base path,
/// cloning the project repository on first use.
#[derive(Clone, Default)]
pub struct WorktreeManager;

impl WorktreeManager {
    pub fn new() -> Self {
        Self
    }

    async fn ensure_repo(&self, request: &WorktreeRequest) -> Result<PathBuf, WorktreeError> {
        let repo_dir = project_repo_dir(&request.worktree_base_path);
        if repo_dir.join(".git").exists() {
            return Ok(repo_dir);
        }
        tokio::fs::create_dir_all(&request.worktree_base_path).await?;
        tracing::info!(
            "Cloning {} into {} for project {}",
            request.repository_url,
            repo_dir.display(),
            request.project_id
        );
        run_git(
            &request.worktree_base_path,
            [
                std::ffi::OsStr::new("clone"),
                std::ffi::OsStr::new(&request.repository_url),
                repo_dir.as_os_str(),
            ],
        )
        .await?;
        Ok(repo_dir)
    }
}

#[async_trait]
impl WorktreeProvisioner for WorktreeManager {
    async fn create_worktree_for_task(
        &self,
        request: &WorktreeRequest,
    ) -> Result<ProvisionedWorktree, WorktreeError> {
        let repo_dir = self.ensure_repo(request).await?;
        let branch_name = branch_name_for_task(&request.task_id, &request.task_title);
        let worktree_path = request
            .worktree_base_path
            .join(dir_name_for_task(&request.task_id, &request.task_title));

        let lock = {
            let mut locks = WORKTREE_CREATION_LOCKS.lock().unwrap();
            locks
                .entry(worktree_path.to_string_lossy().into_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if worktree_path.exists() {
            tracing::debug!("Worktree already exists at {}", worktree_path.display());
            return Ok(ProvisionedWorktree {
                branch_name,
                worktree_path,
            });
        }

        run_git(
            &repo_dir,
            [
                std::ffi::OsStr::new("worktree"),
                std::ffi::OsStr::new("add"),
                std::ffi::OsStr::new("-b"),
                std::ffi::OsStr::new(&branch_name),
                worktree_path.as_os_str(),
            ],
        )
        .await?;

        Ok(ProvisionedWorktree {
            branch_name,
            worktree_path,
        })
    }
}
