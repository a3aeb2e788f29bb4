use crate::executor::{ExecutionReport, TestExecutor};
use crate::notify::Notifier;
use crate::state::{BisectStatus, BisectionSession};
use crate::vcs::{BisectSession, Repository};
use culprit_core::{BisectError, BisectStep, ExecutionOutcome, Probe, ProbeRole, Revision};
use tokio_util::sync::CancellationToken;

/// Drives one session: validate both endpoints, then hand range narrowing
/// to the bisection session until it reports the first bad revision.
pub struct BisectionController<'a> {
    repo: &'a dyn Repository,
    bisect: &'a dyn BisectSession,
    executor: TestExecutor<'a>,
    notifier: &'a dyn Notifier,
}

impl<'a> BisectionController<'a> {
    pub fn new(
        repo: &'a dyn Repository,
        bisect: &'a dyn BisectSession,
        executor: TestExecutor<'a>,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            repo,
            bisect,
            executor,
            notifier,
        }
    }

    /// Run to convergence. Any error leaves the session `Aborted`.
    pub async fn run(
        &self,
        session: &mut BisectionSession,
        cancel: &CancellationToken,
    ) -> Result<Revision, BisectError> {
        let result = self.drive(session, cancel).await;
        if result.is_err() {
            session.abort();
        }
        result
    }

    /// Endpoint validation only; the session stays in `Validating` on
    /// success.
    pub async fn validate(
        &self,
        session: &mut BisectionSession,
        cancel: &CancellationToken,
    ) -> Result<(), BisectError> {
        let result = self.validate_endpoints(session, cancel).await;
        if result.is_err() {
            session.abort();
        }
        result
    }

    async fn drive(
        &self,
        session: &mut BisectionSession,
        cancel: &CancellationToken,
    ) -> Result<Revision, BisectError> {
        self.validate_endpoints(session, cancel).await?;
        session.transition(BisectStatus::Bisecting)?;
        self.search(session, cancel).await
    }

    async fn validate_endpoints(
        &self,
        session: &mut BisectionSession,
        cancel: &CancellationToken,
    ) -> Result<(), BisectError> {
        let good = session.good.clone();
        let bad = session.bad.clone();

        self.notifier
            .notify(&format!("\n▶ Validating good revision {}", good.short()))
            .await;
        self.repo.checkout(good.as_str()).await?;
        session.current = Some(good.clone());
        if self.probe(session, &good, ProbeRole::ValidateGood, cancel).await? != ExecutionOutcome::Pass {
            return Err(BisectError::ValidationFailed(format!(
                "good commit {} fails",
                good.short()
            )));
        }

        self.notifier
            .notify(&format!("\n▶ Validating bad revision {}", bad.short()))
            .await;
        self.repo.checkout(bad.as_str()).await?;
        session.current = Some(bad.clone());
        if self.probe(session, &bad, ProbeRole::ValidateBad, cancel).await? != ExecutionOutcome::Fail {
            return Err(BisectError::ValidationFailed(format!(
                "bad commit {} passes",
                bad.short()
            )));
        }
        Ok(())
    }

    async fn search(
        &self,
        session: &mut BisectionSession,
        cancel: &CancellationToken,
    ) -> Result<Revision, BisectError> {
        self.notifier
            .notify(&format!(
                "\n▶ Bisecting {}..{}",
                session.good.short(),
                session.bad.short()
            ))
            .await;
        let mut step = self.bisect.start(&session.good, &session.bad).await?;
        loop {
            match step {
                BisectStep::Converged(first_bad) => {
                    session.current = None;
                    session.first_bad = Some(first_bad.clone());
                    session.transition(BisectStatus::Converged)?;
                    tracing::info!(revision = %first_bad, probes = session.search_probes(), "converged");
                    self.notifier
                        .notify(&format!(
                            "\n✓ First bad revision: {first_bad} ({} probes)",
                            session.search_probes()
                        ))
                        .await;
                    return Ok(first_bad);
                }
                BisectStep::Next(candidate) => {
                    if cancel.is_cancelled() {
                        return Err(BisectError::Interrupted);
                    }
                    session.current = Some(candidate.clone());
                    self.notifier
                        .notify(&format!(
                            "▶ [{}] Testing {}",
                            session.search_probes() + 1,
                            candidate.short()
                        ))
                        .await;
                    let outcome = self
                        .probe(session, &candidate, ProbeRole::Search, cancel)
                        .await?;
                    step = self.bisect.report(outcome.verdict()).await?;
                }
            }
        }
    }

    /// Run the executor at the checked-out `revision` and record the probe.
    async fn probe(
        &self,
        session: &mut BisectionSession,
        revision: &Revision,
        role: ProbeRole,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, BisectError> {
        tracing::info!(revision = %revision, target = self.executor.target(), role = ?role, "running test");
        let ExecutionReport {
            outcome,
            failure,
            duration,
        } = self.executor.run(cancel).await?;

        let line = match (&outcome, &failure) {
            (ExecutionOutcome::Pass, _) => format!(
                "  ✓ {} passes ({})",
                revision.short(),
                format_elapsed(duration)
            ),
            (ExecutionOutcome::Fail, Some(kind)) => format!(
                "  ✗ {} fails: {kind} ({})",
                revision.short(),
                format_elapsed(duration)
            ),
            (ExecutionOutcome::Fail, None) => format!(
                "  ✗ {} fails ({})",
                revision.short(),
                format_elapsed(duration)
            ),
        };
        self.notifier.notify(&line).await;

        session.record(Probe {
            revision: revision.clone(),
            role,
            outcome,
            failure,
            duration_ms: duration.as_millis() as u64,
        });
        Ok(outcome)
    }
}

fn format_elapsed(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}
