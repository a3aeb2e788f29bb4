use crate::lifecycle::ScopedResource;
use crate::process::{run_shell, run_shell_streamed};
use anyhow::{bail, Result};
use culprit_core::config::EnvironmentConfig;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Execution environment driven by shell commands (`make docker.up` / `make docker.down`
/// by default). `up`, `down` and `force_down` stream to the terminal; the
/// readiness probe is captured.
pub struct CommandEnvironment {
    config: EnvironmentConfig,
    cwd: PathBuf,
    held: AtomicBool,
}

impl CommandEnvironment {
    pub fn new(config: EnvironmentConfig, cwd: PathBuf) -> Self {
        Self {
            config,
            cwd,
            held: AtomicBool::new(false),
        }
    }

    async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => bail!("interrupted while waiting for environment"),
        }
    }

    /// Poll the readiness command until it passes or the timeout elapses.
    async fn wait_ready(&self, cmd: &str, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();
        let deadline = start.checked_add(Duration::from_secs(self.config.ready_timeout_sec));
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            let out = run_shell(cmd, &self.cwd).await?;
            if out.success {
                tracing::debug!(attempt, elapsed_ms = start.elapsed().as_millis() as u64, "environment ready");
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                bail!(
                    "not ready after {}s ({attempt} attempts). Last: {}",
                    self.config.ready_timeout_sec,
                    out.failure_detail()
                );
            }
            let delay = compute_backoff(self.config.ready_interval_sec, attempt);
            let delay = match deadline {
                Some(d) => delay.min(d.saturating_duration_since(Instant::now())),
                None => delay,
            };
            Self::sleep_or_cancel(delay, cancel).await?;
        }
    }
}

/// Linear backoff, capped at 30 seconds.
fn compute_backoff(base_sec: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_sec.saturating_mul(attempt as u64).min(30))
}

fn exit_detail(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit {code}"),
        None => "killed by signal".to_string(),
    }
}

#[async_trait::async_trait]
impl ScopedResource for CommandEnvironment {
    fn name(&self) -> &str {
        "environment"
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        // Marked before running `up` so a partial start is still torn down.
        self.held.store(true, Ordering::SeqCst);
        tracing::info!(cmd = %self.config.up, "starting environment");
        let status = run_shell_streamed(&self.config.up, &self.cwd).await?;
        if !status.success() {
            bail!("`{}` failed: {}", self.config.up, exit_detail(status));
        }
        Self::sleep_or_cancel(Duration::from_secs(self.config.settle_sec), cancel).await?;
        if let Some(cmd) = &self.config.ready_cmd {
            self.wait_ready(cmd, cancel).await?;
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        tracing::info!(cmd = %self.config.down, "stopping environment");
        let status = run_shell_streamed(&self.config.down, &self.cwd).await?;
        self.held.store(false, Ordering::SeqCst);
        if !status.success() {
            bail!("`{}` failed: {}", self.config.down, exit_detail(status));
        }
        Ok(())
    }

    async fn force_release(&self) -> Result<()> {
        self.held.store(false, Ordering::SeqCst);
        let Some(cmd) = &self.config.force_down else {
            bail!("no environment.force_down command configured");
        };
        tracing::warn!(cmd = %cmd, "forcing environment stop");
        let status = run_shell_streamed(cmd, &self.cwd).await?;
        if !status.success() {
            bail!("`{cmd}` failed: {}", exit_detail(status));
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// In-memory environment for tests. Counts calls and fails `acquire` on
/// the configured (1-based) attempts.
#[derive(Default)]
pub struct MockEnvironment {
    ups: AtomicU32,
    downs: AtomicU32,
    forced: AtomicU32,
    held: AtomicBool,
    fail_up_on: Mutex<Vec<u32>>,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_up_on(&self, attempts: Vec<u32>) {
        *self.fail_up_on.lock().unwrap() = attempts;
    }

    pub fn ups(&self) -> u32 {
        self.ups.load(Ordering::SeqCst)
    }

    pub fn downs(&self) -> u32 {
        self.downs.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> u32 {
        self.forced.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ScopedResource for MockEnvironment {
    fn name(&self) -> &str {
        "mock-environment"
    }

    async fn acquire(&self, _cancel: &CancellationToken) -> Result<()> {
        self.held.store(true, Ordering::SeqCst);
        let n = self.ups.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_up_on.lock().unwrap().contains(&n) {
            bail!("(mock) environment failed to start on attempt {n}");
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.downs.fetch_add(1, Ordering::SeqCst);
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn force_release(&self) -> Result<()> {
        self.forced.fetch_add(1, Ordering::SeqCst);
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}
