use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::StreamExt;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    process::Command,
    sync::{Mutex, RwLock},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use utils::procout::{OutputSource, ProcOutput};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Command is empty")]
    EmptyCommand,
    #[error("Working directory does not exist: {0}")]
    WorkDirMissing(PathBuf),
    #[error("Process {0} is not running")]
    NotRunning(Uuid),
    #[error("Failed to signal process group: {0}")]
    Signal(std::io::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Killed,
    Error,
}

/// Shell that interprets agent command lines, so pipes and redirections work.
/// bash where available, sh otherwise; cmd on Windows.
fn shell_invocation() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/C")
    } else if Path::new("/bin/bash").exists() {
        ("bash", "-c")
    } else {
        ("sh", "-c")
    }
}

/// One shell-interpreted subprocess under supervision.
///
/// The handle stays valid after the process exits; output buffers and exit
/// metadata survive until the last `Arc` is dropped.
pub struct ProcessHandle {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub command: String,
    pub work_dir: PathBuf,
    pub start_time: DateTime<Utc>,
    status: StdRwLock<ProcessStatus>,
    end_time: StdRwLock<Option<DateTime<Utc>>>,
    exit_code: StdRwLock<Option<i64>>,
    error: StdRwLock<Option<String>>,
    output: ProcOutput,
    done: CancellationToken,
}

impl ProcessHandle {
    pub fn status(&self) -> ProcessStatus {
        *self.status.read().unwrap()
    }

    pub fn exit_code(&self) -> Option<i64> {
        *self.exit_code.read().unwrap()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        *self.end_time.read().unwrap()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap().clone()
    }

    pub fn output(&self) -> &ProcOutput {
        &self.output
    }

    /// Cancelled once the process has fully stopped and both pipes drained.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time().unwrap_or_else(Utc::now) - self.start_time
    }

    fn set_status(&self, status: ProcessStatus) {
        *self.status.write().unwrap() = status;
    }

    fn finish(&self, status: ProcessStatus, exit_code: Option<i64>, error: Option<String>) {
        // A kill already stamped its status; don't overwrite it with Stopped.
        {
            let mut current = self.status.write().unwrap();
            if *current != ProcessStatus::Killed || status == ProcessStatus::Error {
                *current = status;
            }
        }
        *self.exit_code.write().unwrap() = exit_code;
        *self.end_time.write().unwrap() = Some(Utc::now());
        if let Some(error) = error {
            *self.error.write().unwrap() = Some(error);
        }
        self.done.cancel();
    }
}

/// Spawns and tracks live subprocesses. Commands run under a POSIX shell so
/// pipes and redirections work; the whole process group is signalled on
/// terminate/kill.
#[derive(Clone, Default)]
pub struct ProcessManager {
    processes: Arc<RwLock<HashMap<Uuid, Arc<ProcessHandle>>>>,
    children: Arc<RwLock<HashMap<Uuid, Arc<Mutex<AsyncGroupChild>>>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` in `work_dir`, writing `stdin_payload` fully to stdin
    /// before closing it. The environment is inherited, with `AI_PROCESS_ID`
    /// and `AI_WORK_DIR` added.
    pub async fn spawn(
        &self,
        command: &str,
        work_dir: &Path,
        stdin_payload: Option<&str>,
    ) -> Result<Arc<ProcessHandle>, ProcessError> {
        if command.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        if !work_dir.is_dir() {
            return Err(ProcessError::WorkDirMissing(work_dir.to_path_buf()));
        }

        let id = Uuid::new_v4();
        let (shell_cmd, shell_arg) = shell_invocation();
        let mut cmd = Command::new(shell_cmd);
        cmd.kill_on_drop(true)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(work_dir)
            .env("AI_PROCESS_ID", id.to_string())
            .env("AI_WORK_DIR", work_dir.as_os_str())
            .arg(shell_arg)
            .arg(command);

        let mut child = cmd.group_spawn()?;

        // Feed the payload in, then close the pipe so the agent sees EOF.
        if let Some(payload) = stdin_payload
            && let Some(mut stdin) = child.inner().stdin.take()
        {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let handle = Arc::new(ProcessHandle {
            id,
            pid: child.inner().id(),
            command: command.to_string(),
            work_dir: work_dir.to_path_buf(),
            start_time: Utc::now(),
            status: StdRwLock::new(ProcessStatus::Starting),
            end_time: StdRwLock::new(None),
            exit_code: StdRwLock::new(None),
            error: StdRwLock::new(None),
            output: ProcOutput::new(),
            done: CancellationToken::new(),
        });

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();
        let child = Arc::new(Mutex::new(child));

        {
            self.processes.write().await.insert(id, handle.clone());
            self.children.write().await.insert(id, child.clone());
        }
        handle.set_status(ProcessStatus::Running);

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            let handle = handle.clone();
            readers.push(tokio::spawn(async move {
                let mut stream = ReaderStream::new(stdout);
                while let Some(Ok(chunk)) = stream.next().await {
                    handle
                        .output
                        .push(OutputSource::Stdout, &String::from_utf8_lossy(&chunk));
                }
            }));
        }
        if let Some(stderr) = stderr {
            let handle = handle.clone();
            readers.push(tokio::spawn(async move {
                let mut stream = ReaderStream::new(stderr);
                while let Some(Ok(chunk)) = stream.next().await {
                    handle
                        .output
                        .push(OutputSource::Stderr, &String::from_utf8_lossy(&chunk));
                }
            }));
        }

        self.spawn_waiter(handle.clone(), child, readers);
        Ok(handle)
    }

    /// Poll the child until it exits, drain the readers, then finalize the
    /// handle and drop it from the live registry.
    fn spawn_waiter(
        &self,
        handle: Arc<ProcessHandle>,
        child: Arc<Mutex<AsyncGroupChild>>,
        readers: Vec<tokio::task::JoinHandle<()>>,
    ) {
        let processes = self.processes.clone();
        let children = self.children.clone();

        tokio::spawn(async move {
            let status = loop {
                let polled = { child.lock().await.try_wait() };
                match polled {
                    Ok(Some(status)) => break Ok(status),
                    Ok(None) => tokio::time::sleep(Duration::from_millis(250)).await,
                    Err(e) => break Err(e),
                }
            };

            // Readers must hit EOF before the process counts as stopped.
            for reader in readers {
                let _ = reader.await;
            }

            // Deregister first so the done token is only observable after the
            // registry no longer lists the process.
            processes.write().await.remove(&handle.id);
            children.write().await.remove(&handle.id);

            match status {
                Ok(exit_status) => {
                    let code = exit_status.code().map(|c| c as i64);
                    handle.finish(ProcessStatus::Stopped, code, None);
                }
                Err(e) => {
                    handle.finish(
                        ProcessStatus::Error,
                        None,
                        Some(format!("wait failed: {e}")),
                    );
                }
            }
        });
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<ProcessHandle>> {
        self.processes.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<ProcessHandle>> {
        self.processes.read().await.values().cloned().collect()
    }

    /// Graceful stop: SIGTERM to the whole process group.
    pub async fn terminate(&self, id: Uuid) -> Result<(), ProcessError> {
        let child = self
            .children
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ProcessError::NotRunning(id))?;
        let mut guard = child.lock().await;
        Self::signal_group(&mut guard, GroupSignal::Term)
    }

    /// Forceful stop: SIGKILL to the whole process group. The waiter observes
    /// the exit and removes the process from the registry shortly after.
    pub async fn kill(&self, id: Uuid) -> Result<(), ProcessError> {
        let child = self
            .children
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ProcessError::NotRunning(id))?;
        if let Some(handle) = self.get(id).await {
            handle.set_status(ProcessStatus::Killed);
        }
        let mut guard = child.lock().await;
        Self::signal_group(&mut guard, GroupSignal::Kill)?;
        let _ = guard.kill().await;
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(child: &mut AsyncGroupChild, signal: GroupSignal) -> Result<(), ProcessError> {
        use nix::{
            sys::signal::{Signal, killpg},
            unistd::{Pid, getpgid},
        };

        let Some(pid) = child.inner().id() else {
            return Ok(()); // already reaped
        };
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| ProcessError::Signal(std::io::Error::other(e)))?;
        let sig = match signal {
            GroupSignal::Term => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        killpg(pgid, sig).map_err(|e| ProcessError::Signal(std::io::Error::other(e)))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal_group(_child: &mut AsyncGroupChild, _signal: GroupSignal) -> Result<(), ProcessError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProcessManager::new();
        let handle = pm
            .spawn("echo out; echo err >&2; exit 3", dir.path(), None)
            .await
            .unwrap();

        handle.done_token().cancelled().await;
        assert_eq!(handle.status(), ProcessStatus::Stopped);
        assert_eq!(handle.exit_code(), Some(3));
        assert_eq!(handle.output().stdout_snapshot(), "out\n");
        assert_eq!(handle.output().stderr_snapshot(), "err\n");
    }

    #[tokio::test]
    async fn stdin_payload_is_fed_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProcessManager::new();
        let handle = pm.spawn("cat", dir.path(), Some("hello")).await.unwrap();

        handle.done_token().cancelled().await;
        assert_eq!(handle.exit_code(), Some(0));
        assert_eq!(handle.output().stdout_snapshot(), "hello");
    }

    #[tokio::test]
    async fn env_carries_process_id_and_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProcessManager::new();
        let handle = pm
            .spawn("printf '%s %s' \"$AI_PROCESS_ID\" \"$AI_WORK_DIR\"", dir.path(), None)
            .await
            .unwrap();

        handle.done_token().cancelled().await;
        let out = handle.output().stdout_snapshot();
        assert!(out.contains(&handle.id.to_string()));
        assert!(out.contains(dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn spawn_rejects_bad_inputs_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProcessManager::new();
        assert!(matches!(
            pm.spawn("  ", dir.path(), None).await,
            Err(ProcessError::EmptyCommand)
        ));
        assert!(matches!(
            pm.spawn("true", Path::new("/nonexistent/devflow"), None).await,
            Err(ProcessError::WorkDirMissing(_))
        ));
    }

    #[tokio::test]
    async fn kill_stops_process_and_double_kill_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProcessManager::new();
        let handle = pm.spawn("sleep 30", dir.path(), None).await.unwrap();

        pm.kill(handle.id).await.unwrap();
        handle.done_token().cancelled().await;
        assert_eq!(handle.status(), ProcessStatus::Killed);

        // The waiter removed the process from the registry by now.
        assert!(matches!(
            pm.kill(handle.id).await,
            Err(ProcessError::NotRunning(_))
        ));
        assert!(matches!(
            pm.terminate(handle.id).await,
            Err(ProcessError::NotRunning(_))
        ));
    }
}
