use crate::controller::BisectionController;
use crate::executor::{TestExecutor, TestRunner};
use crate::guard::StateGuard;
use crate::lifecycle::ScopedResource;
use crate::notify::Notifier;
use crate::preflight::validate_inputs;
use crate::resolver::{Resolved, RevisionResolver};
use crate::snapshot::WorkingTreeSnapshot;
use crate::state::{now_rfc3339, BisectStatus, BisectionSession};
use crate::vcs::{BisectSession, Repository};
use culprit_core::config::Config;
use culprit_core::{BisectError, Probe, Revision};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The external tools one run talks to.
pub struct Collaborators<'a> {
    pub repo: &'a dyn Repository,
    pub bisect: &'a dyn BisectSession,
    pub environment: &'a dyn ScopedResource,
    pub runner: &'a dyn TestRunner,
    pub notifier: &'a dyn Notifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Validate endpoints, then search.
    Bisect,
    /// Validate endpoints only.
    ValidateOnly,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct BisectReport {
    pub status: BisectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad: Option<Revision>,
    pub good: Revision,
    pub bad: Revision,
    pub original_ref: String,
    pub target: String,
    pub started_at: String,
    pub completed_at: String,
    pub validation_probes: usize,
    pub search_probes: usize,
    pub probes: Vec<Probe>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restore_failures: Vec<String>,
}

/// What a run would do, computed without touching the working tree.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub good: Revision,
    pub good_fell_back: bool,
    pub bad: Revision,
    pub bad_fell_back: bool,
    pub target: String,
    pub command: Vec<String>,
    pub present_files: Vec<String>,
    pub missing_files: Vec<String>,
    pub environment_up: String,
    pub environment_down: String,
}

/// Preflight checks and reference resolution, shared by every mode.
async fn prepare(
    c: &Collaborators<'_>,
    config: &Config,
    launcher: &Path,
) -> Result<(Resolved, Resolved), BisectError> {
    validate_inputs(c.repo, launcher).await?;
    let resolver = RevisionResolver::new(c.repo, config.strict_refs);
    let good = resolver.resolve(&config.good).await?;
    let bad = resolver.resolve(&config.bad).await?;
    for (name, reference, resolved) in [("good", &config.good, &good), ("bad", &config.bad, &bad)] {
        if resolved.fell_back {
            c.notifier
                .notify(&format!(
                    "⚠ {name} reference {reference} does not resolve, using root revision {}",
                    resolved.revision.short()
                ))
                .await;
        }
    }
    if good.revision == bad.revision {
        return Err(BisectError::InvalidInput(format!(
            "good and bad both resolve to {}",
            good.revision
        )));
    }
    Ok((good, bad))
}

/// Resolve and validate inputs and describe the run, without side effects.
pub async fn plan_run(
    c: &Collaborators<'_>,
    config: &Config,
    launcher: &Path,
) -> Result<RunPlan, BisectError> {
    let (good, bad) = prepare(c, config, launcher).await?;
    let (present_files, missing_files): (Vec<String>, Vec<String>) = config
        .test_files
        .iter()
        .cloned()
        .partition(|p| c.repo.root().join(p).is_file());
    let mut command = vec![launcher.display().to_string()];
    command.extend(config.test_args.iter().cloned());
    command.push(config.target.clone());
    Ok(RunPlan {
        good: good.revision,
        good_fell_back: good.fell_back,
        bad: bad.revision,
        bad_fell_back: bad.fell_back,
        target: config.target.clone(),
        command,
        present_files,
        missing_files,
        environment_up: config.environment.up.clone(),
        environment_down: config.environment.down.clone(),
    })
}

/// Run one bisection session end to end. The repository is restored before
/// this returns, whatever the outcome.
pub async fn run_bisection(
    c: &Collaborators<'_>,
    config: &Config,
    launcher: &Path,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<BisectReport, BisectError> {
    let (good, bad) = prepare(c, config, launcher).await?;
    let snapshot = WorkingTreeSnapshot::capture(c.repo.root(), &config.test_files)
        .map_err(|e| BisectError::InvalidInput(format!("{e:#}")))?;
    let snapshot = Arc::new(snapshot);
    let grace = Duration::from_secs(config.environment.grace_sec);

    let guard = StateGuard::capture(c.repo, c.bisect, c.environment, grace).await?;
    let mut session = BisectionSession::new(
        guard.original_ref().to_string(),
        good.revision,
        bad.revision,
        Arc::clone(&snapshot),
    );
    tracing::info!(
        good = %session.good,
        bad = %session.bad,
        target = %config.target,
        files = snapshot.len(),
        "session started"
    );

    let executor = TestExecutor::new(
        c.repo,
        c.environment,
        c.runner,
        &snapshot,
        config.target.clone(),
        grace,
    );
    let controller = BisectionController::new(c.repo, c.bisect, executor, c.notifier);
    let (result, restored) = guard
        .run(async {
            match mode {
                Mode::Bisect => controller.run(&mut session, cancel).await.map(Some),
                Mode::ValidateOnly => controller.validate(&mut session, cancel).await.map(|_| None),
            }
        })
        .await;

    if !restored.is_clean() {
        c.notifier
            .notify(&format!(
                "⚠ Repository not fully restored to {}: {}",
                guard.original_ref(),
                restored.failures.join("; ")
            ))
            .await;
    }
    result?;

    Ok(BisectReport {
        status: session.status,
        first_bad: session.first_bad.clone(),
        good: session.good.clone(),
        bad: session.bad.clone(),
        original_ref: session.original_ref.clone(),
        target: config.target.clone(),
        started_at: session.started_at.clone(),
        completed_at: now_rfc3339(),
        validation_probes: session.validation_probes(),
        search_probes: session.search_probes(),
        probes: session.probes,
        restore_failures: restored.failures,
    })
}
