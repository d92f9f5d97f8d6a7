// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Helper process lifecycle management.

use crate::core::{CoreError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

/// How a process ended. `status` is `None` if waiting on it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: Option<ExitStatus>,
}

/// Handle to a running subprocess.
///
/// The child itself is owned by a waiter task; the handle observes its exit
/// and can ask the waiter to kill it. Dropping the handle kills the process.
pub struct ProcessHandle {
    pid: u32,
    name: String,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    stdio: Option<(ChildStdin, ChildStdout)>,
}

impl ProcessHandle {
    /// Spawn a subprocess with piped stdin/stdout on `runtime`.
    pub fn spawn(mut command: Command, name: &str, runtime: &tokio::runtime::Handle) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = {
            let _guard = runtime.enter();
            command.spawn().map_err(|e| {
                CoreError::HelperCouldNotStartConnection(format!(
                    "Failed to spawn subprocess '{}': {}",
                    name, e
                ))
            })?
        };

        let pid = child.id().ok_or_else(|| {
            CoreError::HelperNotRunning(format!("Subprocess '{}' exited during spawn", name))
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stdio = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => {
                return Err(CoreError::HelperCouldNotStartConnection(format!(
                    "Subprocess '{}' has no stdio pipes",
                    name
                )));
            }
        };

        tracing::info!("Spawned subprocess '{}' with PID {}", name, pid);

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let task_name = name.to_string();
        runtime.spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    tracing::warn!("Force killing subprocess '{}'", task_name);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let status = match status {
                Ok(status) => {
                    tracing::info!("Subprocess '{}' exited with status: {}", task_name, status);
                    Some(status)
                }
                Err(e) => {
                    tracing::warn!("Failed to wait for subprocess '{}': {}", task_name, e);
                    None
                }
            };
            let _ = exit_tx.send(Some(ProcessExit { status }));
        });

        Ok(Self {
            pid,
            name: name.to_string(),
            kill_tx,
            exit_rx,
            stdio,
        })
    }

    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the process name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the child's stdin and stdout. Returns `None` after the first call.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        self.stdio.take()
    }

    /// Check if the process is still running.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Receiver that can wait for exit independently of the handle.
    pub fn exit_watcher(&self) -> ExitWatcher {
        ExitWatcher {
            rx: self.exit_rx.clone(),
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        self.exit_watcher().wait().await
    }

    /// Force kill the process.
    pub fn kill(&self) {
        if self.is_running() {
            let _ = self.kill_tx.send(());
        }
    }

    /// Wait up to `timeout` for the process to exit on its own, then kill it.
    pub async fn shutdown(&self, timeout: Duration) -> ProcessExit {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(
                    "Subprocess '{}' did not exit within {:?}, force killing",
                    self.name,
                    timeout
                );
                self.kill();
                self.wait().await
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(
                "ProcessHandle for '{}' dropped while still running, killing",
                self.name
            );
            let _ = self.kill_tx.send(());
        }
    }
}

/// Clonable exit observer for a [`ProcessHandle`].
#[derive(Clone)]
pub struct ExitWatcher {
    rx: watch::Receiver<Option<ProcessExit>>,
}

impl ExitWatcher {
    pub async fn wait(mut self) -> ProcessExit {
        match self.rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit { status: None }),
            // Waiter task gone without reporting: the runtime is shutting down.
            Err(_) => ProcessExit { status: None },
        }
    }
}

/// Configuration for subprocess spawning.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Name used in logs.
    pub name: String,
    /// Executable to run.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Environment variables to set.
    pub env: BTreeMap<String, String>,
    /// Working directory for the subprocess.
    pub working_dir: Option<PathBuf>,
    /// Shutdown timeout.
    pub shutdown_timeout: Duration,
}

impl SubprocessConfig {
    /// Create a new subprocess config.
    pub fn new(name: &str, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }

    pub fn spawn(&self, runtime: &tokio::runtime::Handle) -> Result<ProcessHandle> {
        ProcessHandle::spawn(self.command(), &self.name, runtime)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Handle {
        tokio::runtime::Handle::current()
    }

    #[tokio::test]
    async fn test_spawn_failure_is_could_not_start() {
        let err = SubprocessConfig::new("missing", "/nonexistent/corelink-helper")
            .spawn(&runtime())
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(CoreError::HELPER_COULD_NOT_START_CONNECTION));
    }

    #[tokio::test]
    async fn test_wait_observes_exit() {
        let handle = SubprocessConfig::new("true", "true").spawn(&runtime()).unwrap();
        let exit = handle.wait().await;
        assert!(exit.status.unwrap().success());
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_timeout() {
        let handle = SubprocessConfig::new("sleep", "sleep")
            .with_arg("30")
            .spawn(&runtime())
            .unwrap();
        assert!(handle.is_running());
        let exit = handle.shutdown(Duration::from_millis(50)).await;
        assert!(!exit.status.unwrap().success());
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let handle = SubprocessConfig::new("sleep", "sleep")
            .with_arg("30")
            .spawn(&runtime())
            .unwrap();
        let watcher = handle.exit_watcher();
        drop(handle);
        let exit = tokio::time::timeout(Duration::from_secs(5), watcher.wait())
            .await
            .unwrap();
        assert!(exit.status.is_some());
    }
}
