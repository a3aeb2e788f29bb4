//! Restores the repository to the state it was in when the run started.
//!
//! Capture happens before the first mutation. Restore runs on every exit
//! path and performs each step independently: a failing step is reported
//! and the remaining steps still run.

use crate::lifecycle::{release_within, ReleaseOutcome, ScopedResource};
use crate::vcs::{BisectSession, Repository};
use culprit_core::BisectError;
use futures::FutureExt;
use std::future::Future;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;

/// One uncommitted change, with the bytes to write back. `None` means the
/// file was deleted locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub path: PathBuf,
    pub content: Option<Vec<u8>>,
}

/// Problems hit while restoring. Empty when everything went back cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub failures: Vec<String>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct StateGuard<'a> {
    repo: &'a dyn Repository,
    bisect: &'a dyn BisectSession,
    environment: &'a dyn ScopedResource,
    original_ref: String,
    changes: Vec<LocalChange>,
    grace: Duration,
}

impl<'a> StateGuard<'a> {
    /// Record the current ref and every uncommitted change. A change that
    /// cannot be read is `InvalidInput`: the run would overwrite it.
    pub async fn capture(
        repo: &'a dyn Repository,
        bisect: &'a dyn BisectSession,
        environment: &'a dyn ScopedResource,
        grace: Duration,
    ) -> Result<StateGuard<'a>, BisectError> {
        let original_ref = repo.current_ref().await?;
        let mut changes = Vec::new();
        for entry in repo.dirty_entries().await? {
            if entry.deleted {
                changes.push(LocalChange {
                    path: entry.path,
                    content: None,
                });
                continue;
            }
            let full = repo.root().join(&entry.path);
            // Dirty submodules: checkout leaves their contents alone.
            if full.is_dir() {
                tracing::debug!(path = %entry.path.display(), "skipping dirty directory");
                continue;
            }
            let content = std::fs::read(&full).map_err(|e| {
                BisectError::InvalidInput(format!(
                    "cannot read local change {}: {e} (commit or stash it first)",
                    entry.path.display()
                ))
            })?;
            changes.push(LocalChange {
                path: entry.path,
                content: Some(content),
            });
        }
        tracing::info!(original_ref = %original_ref, local_changes = changes.len(), "captured repository state");
        Ok(StateGuard {
            repo,
            bisect,
            environment,
            original_ref,
            changes,
            grace,
        })
    }

    pub fn original_ref(&self) -> &str {
        &self.original_ref
    }

    pub fn local_changes(&self) -> &[LocalChange] {
        &self.changes
    }

    /// Await `work`, then restore whatever its outcome. A panic in `work`
    /// is resumed once the repository has been restored.
    pub async fn run<T, Fut>(&self, work: Fut) -> (Result<T, BisectError>, RestoreReport)
    where
        Fut: Future<Output = Result<T, BisectError>>,
    {
        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        let report = self.restore().await;
        match outcome {
            Ok(result) => (result, report),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub async fn restore(&self) -> RestoreReport {
        let mut report = RestoreReport::default();

        // 1. Bisection session
        if let Err(e) = self.bisect.reset().await {
            report.failures.push(format!("bisect reset: {e:#}"));
        }

        // 2. Environment
        if self.environment.is_held() {
            match release_within(self.environment, Some(self.grace)).await {
                ReleaseOutcome::Graceful | ReleaseOutcome::Forced => {}
                ReleaseOutcome::Failed(msg) => {
                    report.failures.push(format!("{} teardown: {msg}", self.environment.name()));
                }
            }
        }

        // 3. Original ref
        if let Err(e) = self.repo.checkout(&self.original_ref).await {
            report
                .failures
                .push(format!("checkout {}: {e:#}", self.original_ref));
        }

        // 4. Local changes
        for change in &self.changes {
            if let Err(e) = self.reapply(change) {
                report
                    .failures
                    .push(format!("restore {}: {e}", change.path.display()));
            }
        }

        for failure in &report.failures {
            tracing::error!(failure = %failure, "restore step failed");
        }
        report
    }

    fn reapply(&self, change: &LocalChange) -> std::io::Result<()> {
        let full = self.repo.root().join(&change.path);
        match &change.content {
            Some(content) => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, content)
            }
            None => match std::fs::remove_file(&full) {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            },
        }
    }
}
