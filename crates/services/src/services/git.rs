use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{Repository, StatusOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Git2(#[from] git2::Error),
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Git operations the job processor consumes. Implemented over the real
/// repository in production and stubbed in tests.
#[async_trait]
pub trait GitOps: Send + Sync {
    async fn has_pending_changes(&self, path: &Path) -> Result<bool, GitError>;
    async fn commit_and_push(
        &self,
        path: &Path,
        message: &str,
        remote: &str,
        branch: &str,
    ) -> Result<(), GitError>;
    async fn delete_worktree(
        &self,
        working_dir: &Path,
        worktree_path: &Path,
    ) -> Result<(), GitError>;
    async fn delete_branch(
        &self,
        working_dir: &Path,
        name: &str,
        force: bool,
    ) -> Result<(), GitError>;
}

/// Run a git subcommand in `dir`, capturing stderr into the error.
///
/// Working-tree mutations go through the CLI: it refuses to clobber
/// uncommitted changes where libgit2 would need hand-rolled safety checks.
pub(crate) async fn run_git<I, S>(dir: &Path, args: I) -> Result<String, GitError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = tokio::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Thin production implementation: libgit2 for read-only status queries, the
/// git CLI for everything that touches the working tree or the network.
#[derive(Clone, Default)]
pub struct GitService;

impl GitService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GitOps for GitService {
    async fn has_pending_changes(&self, path: &Path) -> Result<bool, GitError> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<bool, GitError> {
            let repo = Repository::open(&path)?;
            let mut options = StatusOptions::new();
            options.include_untracked(true).include_ignored(false);
            let statuses = repo.statuses(Some(&mut options))?;
            Ok(!statuses.is_empty())
        })
        .await
        .map_err(|e| GitError::TaskJoin(e.to_string()))?
    }

    async fn commit_and_push(
        &self,
        path: &Path,
        message: &str,
        remote: &str,
        branch: &str,
    ) -> Result<(), GitError> {
        run_git(path, ["add", "-A"]).await?;
        run_git(path, ["commit", "-m", message]).await?;
        run_git(path, ["push", remote, branch]).await?;
        Ok(())
    }

    async fn delete_worktree(
        &self,
        working_dir: &Path,
        worktree_path: &Path,
    ) -> Result<(), GitError> {
        run_git(
            working_dir,
            [
                std::ffi::OsStr::new("worktree"),
                std::ffi::OsStr::new("remove"),
                std::ffi::OsStr::new("--force"),
                worktree_path.as_os_str(),
            ],
        )
        .await?;
        // Stale metadata is harmless but noisy; prune is best-effort.
        let _ = run_git(working_dir, ["worktree", "prune"]).await;
        Ok(())
    }

    async fn delete_branch(
        &self,
        working_dir: &Path,
        name: &str,
        force: bool,
    ) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        run_git(working_dir, ["branch", flag, name]).await?;
        Ok(())
    }
}
