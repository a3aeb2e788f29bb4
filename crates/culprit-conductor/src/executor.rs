use crate::lifecycle::{scoped, ReleaseOutcome, Scoped, ScopedResource};
use crate::process::{run_cancellable, ProcessExit};
use crate::snapshot::WorkingTreeSnapshot;
use crate::vcs::Repository;
use anyhow::Result;
use culprit_core::{BisectError, ExecutionOutcome, FailureKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs the build/test tool for one target.
#[async_trait::async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_target(
        &self,
        target: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessExit>;
}

/// Invokes `<launcher> <args..> <target>` in the working tree, output
/// streamed to the terminal.
pub struct LauncherRunner {
    launcher: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl LauncherRunner {
    pub fn new(launcher: PathBuf, args: Vec<String>, grace: Duration) -> Self {
        Self {
            launcher,
            args,
            grace,
        }
    }
}

#[async_trait::async_trait]
impl TestRunner for LauncherRunner {
    async fn run_target(
        &self,
        target: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessExit> {
        let mut cmd = Command::new(&self.launcher);
        cmd.args(&self.args).arg(target).current_dir(cwd);
        tracing::debug!(launcher = %self.launcher.display(), args = ?self.args, target, "invoking launcher");
        run_cancellable(cmd, cancel, self.grace).await
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub failure: Option<FailureKind>,
    pub duration: Duration,
}

/// Prepares the checked-out revision and runs the target once.
pub struct TestExecutor<'a> {
    repo: &'a dyn Repository,
    environment: &'a dyn ScopedResource,
    runner: &'a dyn TestRunner,
    snapshot: &'a WorkingTreeSnapshot,
    target: String,
    grace: Duration,
}

impl<'a> TestExecutor<'a> {
    pub fn new(
        repo: &'a dyn Repository,
        environment: &'a dyn ScopedResource,
        runner: &'a dyn TestRunner,
        snapshot: &'a WorkingTreeSnapshot,
        target: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            repo,
            environment,
            runner,
            snapshot,
            target: target.into(),
            grace,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run the target at whatever revision is checked out. Execution errors
    /// are folded into `Fail`; only an interrupt is returned as an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExecutionReport, BisectError> {
        if cancel.is_cancelled() {
            return Err(BisectError::Interrupted);
        }
        let start = Instant::now();
        let paths = self.snapshot.paths();

        let executed = self.execute(&paths, cancel).await;

        // Leave nothing behind that could block the next checkout.
        if let Err(e) = self.repo.discard_changes(&paths).await {
            tracing::warn!(error = %format!("{e:#}"), "post-run cleanup failed");
        }

        let (outcome, failure) = match executed {
            Ok(ProcessExit::Success) => (ExecutionOutcome::Pass, None),
            Ok(ProcessExit::Failed { code }) => {
                (ExecutionOutcome::Fail, Some(FailureKind::TestFailed { code }))
            }
            Ok(ProcessExit::Cancelled { forced }) => {
                tracing::info!(forced, "test run interrupted");
                return Err(BisectError::Interrupted);
            }
            Err(kind) => (ExecutionOutcome::Fail, Some(kind)),
        };
        if cancel.is_cancelled() {
            return Err(BisectError::Interrupted);
        }
        if let Some(kind) = &failure {
            if !matches!(kind, FailureKind::TestFailed { .. }) {
                tracing::warn!(kind = %kind, "execution error counted as failure");
            }
        }
        Ok(ExecutionReport {
            outcome,
            failure,
            duration: start.elapsed(),
        })
    }

    async fn execute(
        &self,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<ProcessExit, FailureKind> {
        let root = self.repo.root();
        self.repo
            .discard_changes(paths)
            .await
            .map_err(|e| FailureKind::TreePreparationFailed {
                error: format!("{e:#}"),
            })?;
        self.snapshot
            .apply(root)
            .map_err(|e| FailureKind::TreePreparationFailed {
                error: format!("{e:#}"),
            })?;

        let (ran, released) = scoped(self.environment, cancel, self.grace, || {
            self.runner.run_target(&self.target, root, cancel)
        })
        .await;
        if let ReleaseOutcome::Failed(msg) = &released {
            tracing::error!(resource = self.environment.name(), error = %msg, "teardown failed");
        }

        match ran {
            Scoped::AcquireFailed(e) => Err(FailureKind::EnvironmentFailed {
                error: format!("{e:#}"),
            }),
            Scoped::Ran(Err(e)) => Err(FailureKind::ToolCrashed {
                error: format!("{e:#}"),
            }),
            Scoped::Ran(Ok(exit)) => Ok(exit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MockEnvironment;
    use crate::vcs::synthetic::SyntheticHistory;

    struct Fixture {
        dir: tempfile::TempDir,
        history: SyntheticHistory,
        env: MockEnvironment,
        snapshot: WorkingTreeSnapshot,
    }

    async fn fixture(checkout: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let history = SyntheticHistory::new(dir.path().to_path_buf(), 10, 6);
        history.checkout(checkout).await.unwrap();
        let mut snapshot = WorkingTreeSnapshot::default();
        snapshot.insert("src/test/Probe.java".into(), b"class Probe {}".to_vec());
        Fixture {
            dir,
            history,
            env: MockEnvironment::new(),
            snapshot,
        }
    }

    impl Fixture {
        fn executor(&self) -> TestExecutor<'_> {
            TestExecutor::new(
                &self.history,
                &self.env,
                &self.history,
                &self.snapshot,
                "//pkg:test",
                Duration::from_secs(1),
            )
        }
    }

    #[tokio::test]
    async fn passing_revision_applies_snapshot_and_pairs_environment() {
        let f = fixture("rev3").await;
        let report = f
            .executor()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Pass);
        assert!(report.failure.is_none());
        assert_eq!(
            std::fs::read(f.dir.path().join("src/test/Probe.java")).unwrap(),
            b"class Probe {}"
        );
        assert_eq!(f.env.ups(), 1);
        assert_eq!(f.env.downs(), 1);
    }

    #[tokio::test]
    async fn failing_revision_records_exit_code() {
        let f = fixture("rev7").await;
        let report = f
            .executor()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Fail);
        assert_eq!(report.failure, Some(FailureKind::TestFailed { code: Some(1) }));
    }

    #[tokio::test]
    async fn environment_failure_is_fail_and_still_torn_down() {
        let f = fixture("rev3").await;
        f.env.fail_up_on(vec![1]);
        let report = f
            .executor()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Fail);
        assert!(matches!(report.failure, Some(FailureKind::EnvironmentFailed { .. })));
        assert_eq!(f.history.test_runs(), 0);
        assert_eq!(f.env.ups(), f.env.downs());
    }

    #[tokio::test]
    async fn tool_crash_is_fail() {
        let f = fixture("rev3").await;
        f.history.crash_on_runs(vec![1]);
        let report = f
            .executor()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Fail);
        assert!(matches!(report.failure, Some(FailureKind::ToolCrashed { .. })));
        assert_eq!(f.env.downs(), 1);
    }

    #[tokio::test]
    async fn reset_failure_skips_environment() {
        let f = fixture("rev3").await;
        f.history.fail_discard_on(vec![1]);
        let report = f
            .executor()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            report.failure,
            Some(FailureKind::TreePreparationFailed { .. })
        ));
        assert_eq!(f.env.ups(), 0);
        assert_eq!(f.history.test_runs(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_is_interrupted_without_side_effects() {
        let f = fixture("rev3").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.executor().run(&cancel).await.unwrap_err();
        assert!(matches!(err, BisectError::Interrupted));
        assert_eq!(f.env.ups(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_run_is_interrupted_and_released() {
        let f = fixture("rev3").await;
        let cancel = CancellationToken::new();
        f.history.cancel_on_run(1, cancel.clone());
        let err = f.executor().run(&cancel).await.unwrap_err();
        assert!(matches!(err, BisectError::Interrupted));
        assert_eq!(f.env.ups(), 1);
        assert_eq!(f.env.downs(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launcher_receives_args_then_target() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let launcher = dir.path().join("launcher.sh");
        std::fs::write(&launcher, "#!/bin/sh\necho \"$@\" > args.txt\nexit 3\n").unwrap();
        std::fs::set_permissions(&launcher, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = LauncherRunner::new(
            launcher,
            vec!["test".into(), "--test_output=errors".into()],
            Duration::from_secs(1),
        );
        let exit = runner
            .run_target("//pkg:it", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Failed { code: Some(3) });
        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "test --test_output=errors //pkg:it");
    }
}
