use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Shell program and args for the current platform.
#[cfg(windows)]
pub fn shell_cmd(cmd: &str) -> (String, Vec<String>) {
    ("cmd.exe".into(), vec!["/C".into(), cmd.into()])
}

#[cfg(not(windows))]
pub fn shell_cmd(cmd: &str) -> (String, Vec<String>) {
    ("sh".into(), vec!["-c".into(), cmd.into()])
}

/// Captured result of a finished shell command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// One-line failure description with a bounded stderr excerpt.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let truncated = if stderr.len() > 2000 {
            let mut end = 2000;
            while !stderr.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &stderr[..end])
        } else {
            stderr.to_string()
        };
        format!("exit {}: {}", self.code.unwrap_or(-1), truncated)
    }
}

/// Run a shell command to completion, capturing its output. No timeout:
/// callers that need one wrap the future in `tokio::time::timeout`, which
/// kills the child on drop.
pub async fn run_shell(cmd: &str, cwd: &Path) -> Result<CommandOutput> {
    let (shell, args) = shell_cmd(cmd);
    let output = Command::new(&shell)
        .args(&args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning `{cmd}`"))?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a shell command to completion with stdout and stderr inherited, so
/// its progress reaches the terminal.
pub async fn run_shell_streamed(cmd: &str, cwd: &Path) -> Result<std::process::ExitStatus> {
    let (shell, args) = shell_cmd(cmd);
    Command::new(&shell)
        .args(&args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("spawning `{cmd}`"))
}

/// How a cancellable child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Success,
    Failed { code: Option<i32> },
    /// Cancellation arrived while the child was running. `forced` is set
    /// when the child outlived the grace period and was killed.
    Cancelled { forced: bool },
}

/// Spawn `cmd` with inherited stdio and wait for it. On cancellation the
/// child gets `grace` to exit on its own (an interactive interrupt reaches
/// the whole process group) before it is killed.
pub async fn run_cancellable(
    mut cmd: Command,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<ProcessExit> {
    let mut child = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("spawning process")?;

    tokio::select! {
        status = child.wait() => {
            let status = status.context("waiting for process")?;
            if status.success() {
                Ok(ProcessExit::Success)
            } else {
                Ok(ProcessExit::Failed { code: status.code() })
            }
        }
        _ = cancel.cancelled() => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(_)) => Ok(ProcessExit::Cancelled { forced: false }),
                _ => {
                    tracing::warn!(grace_ms = grace.as_millis() as u64, "process outlived grace period, killing");
                    child.kill().await.ok();
                    Ok(ProcessExit::Cancelled { forced: true })
                }
            }
        }
    }
}
