//! Deterministic in-memory collaborator: a linear history `rev1..revN`
//! where every revision from a configurable flip point onward fails.
//! Implements the repository, the bisection session and the test runner so
//! the controller can be driven without git or a build tool.

use crate::executor::TestRunner;
use crate::process::ProcessExit;
use crate::vcs::{BisectSession, DirtyEntry, Repository};
use anyhow::{bail, Result};
use culprit_core::{BisectError, BisectStep, Revision, Verdict};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const BRANCH: &str = "main";

#[derive(Debug)]
struct State {
    /// Branch name or revision currently checked out.
    checked_out: String,
    /// Last known good and first known bad index of an active session.
    range: Option<(usize, usize)>,
    /// HEAD when the session started; restored by `reset`.
    pre_bisect: Option<String>,
    reports: u32,
    test_runs: u32,
    discards: u32,
    fail_report_on: Option<u32>,
    fail_discard_on: Vec<u32>,
    crash_on_runs: Vec<u32>,
    cancel_on_run: Option<(u32, CancellationToken)>,
}

pub struct SyntheticHistory {
    root: PathBuf,
    len: usize,
    first_bad: usize,
    state: Mutex<State>,
}

impl SyntheticHistory {
    /// `len` revisions, `rev{first_bad}` and later fail (both 1-based).
    pub fn new(root: PathBuf, len: usize, first_bad: usize) -> Self {
        assert!(len >= 1 && first_bad >= 1, "revisions are 1-based");
        Self {
            root,
            len,
            first_bad,
            state: Mutex::new(State {
                checked_out: BRANCH.into(),
                range: None,
                pre_bisect: None,
                reports: 0,
                test_runs: 0,
                discards: 0,
                fail_report_on: None,
                fail_discard_on: Vec::new(),
                crash_on_runs: Vec::new(),
                cancel_on_run: None,
            }),
        }
    }

    pub fn rev(n: usize) -> Revision {
        Revision::new(format!("rev{n}"))
    }

    /// Make the n-th (1-based) verdict report fail like a broken tool.
    pub fn fail_report_on(&self, n: u32) {
        self.state.lock().unwrap().fail_report_on = Some(n);
    }

    /// Make the listed (1-based) `discard_changes` calls fail.
    pub fn fail_discard_on(&self, calls: Vec<u32>) {
        self.state.lock().unwrap().fail_discard_on = calls;
    }

    /// Make the listed (1-based) test runs fail to spawn.
    pub fn crash_on_runs(&self, runs: Vec<u32>) {
        self.state.lock().unwrap().crash_on_runs = runs;
    }

    /// Cancel `token` while the n-th (1-based) test run is in progress,
    /// as an interactive interrupt would.
    pub fn cancel_on_run(&self, n: u32, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_run = Some((n, token));
    }

    pub fn checked_out(&self) -> String {
        self.state.lock().unwrap().checked_out.clone()
    }

    pub fn test_runs(&self) -> u32 {
        self.state.lock().unwrap().test_runs
    }

    pub fn is_bisecting(&self) -> bool {
        self.state.lock().unwrap().range.is_some()
    }

    fn index_of(&self, reference: &str) -> Option<usize> {
        let n: usize = reference.strip_prefix("rev")?.parse().ok()?;
        (1..=self.len).contains(&n).then_some(n)
    }

    fn head_index(&self, state: &State) -> Option<usize> {
        if state.checked_out == BRANCH {
            Some(self.len)
        } else {
            self.index_of(&state.checked_out)
        }
    }

    /// Pick the midpoint of the open range, or converge.
    fn step(&self, state: &mut State) -> BisectStep {
        let Some((lo, hi)) = state.range else {
            unreachable!("step without a session");
        };
        if hi - lo <= 1 {
            return BisectStep::Converged(Self::rev(hi));
        }
        let mid = lo + (hi - lo) / 2;
        state.checked_out = Self::rev(mid).to_string();
        BisectStep::Next(Self::rev(mid))
    }
}

#[async_trait::async_trait]
impl Repository for SyntheticHistory {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn top_level(&self) -> Result<Option<PathBuf>> {
        Ok(Some(self.root.clone()))
    }

    async fn resolve(&self, reference: &str) -> Result<Option<Revision>> {
        let state = self.state.lock().unwrap();
        let head = self.head_index(&state);
        let idx = match reference {
            "HEAD" => head,
            BRANCH => Some(self.len),
            r if r.starts_with("HEAD~") => {
                let back: usize = r["HEAD~".len()..].parse()?;
                head.and_then(|h| h.checked_sub(back)).filter(|i| *i >= 1)
            }
            r => self.index_of(r),
        };
        Ok(idx.map(Self::rev))
    }

    async fn root_revision(&self) -> Result<Revision> {
        Ok(Self::rev(1))
    }

    async fn current_ref(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().checked_out.clone())
    }

    async fn head(&self) -> Result<Revision> {
        let state = self.state.lock().unwrap();
        match self.head_index(&state) {
            Some(i) => Ok(Self::rev(i)),
            None => bail!("unknown checkout {}", state.checked_out),
        }
    }

    async fn checkout(&self, target: &str) -> Result<()> {
        if target != BRANCH && self.index_of(target).is_none() {
            bail!("pathspec '{target}' did not match");
        }
        self.state.lock().unwrap().checked_out = target.to_string();
        Ok(())
    }

    async fn discard_changes(&self, _paths: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.discards += 1;
        if state.fail_discard_on.contains(&state.discards) {
            bail!("(synthetic) reset failed on call {}", state.discards);
        }
        Ok(())
    }

    /// The synthetic tree never has local changes.
    async fn dirty_entries(&self) -> Result<Vec<DirtyEntry>> {
        Ok(Vec::new())
    }
}

#[async_trait::async_trait]
impl BisectSession for SyntheticHistory {
    async fn start(&self, good: &Revision, bad: &Revision) -> Result<BisectStep, BisectError> {
        let (Some(lo), Some(hi)) = (self.index_of(good.as_str()), self.index_of(bad.as_str()))
        else {
            return Err(BisectError::BisectToolFailure(format!(
                "unknown revision in {good}..{bad}"
            )));
        };
        if lo >= hi {
            return Err(BisectError::BisectToolFailure(format!(
                "{good} is not an ancestor of {bad}"
            )));
        }
        let mut state = self.state.lock().unwrap();
        state.pre_bisect = Some(state.checked_out.clone());
        state.range = Some((lo, hi));
        Ok(self.step(&mut state))
    }

    async fn report(&self, verdict: Verdict) -> Result<BisectStep, BisectError> {
        let mut state = self.state.lock().unwrap();
        state.reports += 1;
        if state.fail_report_on == Some(state.reports) {
            return Err(BisectError::BisectToolFailure(
                "(synthetic) bisect state is corrupt".into(),
            ));
        }
        let Some((lo, hi)) = state.range else {
            return Err(BisectError::BisectToolFailure(
                "You need to start by \"git bisect start\"".into(),
            ));
        };
        let current = self.head_index(&state).unwrap_or(hi);
        state.range = Some(match verdict {
            Verdict::Good => (current.max(lo), hi),
            Verdict::Bad => (lo, current.min(hi)),
        });
        Ok(self.step(&mut state))
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.range = None;
        if let Some(original) = state.pre_bisect.take() {
            state.checked_out = original;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TestRunner for SyntheticHistory {
    async fn run_target(
        &self,
        _target: &str,
        _cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessExit> {
        let mut state = self.state.lock().unwrap();
        state.test_runs += 1;
        let run = state.test_runs;
        if let Some((n, token)) = &state.cancel_on_run {
            if *n == run {
                token.cancel();
            }
        }
        if cancel.is_cancelled() {
            return Ok(ProcessExit::Cancelled { forced: false });
        }
        if state.crash_on_runs.contains(&run) {
            bail!("(synthetic) launcher crashed on run {run}");
        }
        match self.head_index(&state) {
            Some(i) if i < self.first_bad => Ok(ProcessExit::Success),
            Some(_) => Ok(ProcessExit::Failed { code: Some(1) }),
            None => bail!("nothing checked out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_relative_to_branch_head() {
        let h = SyntheticHistory::new(PathBuf::from("."), 10, 4);
        assert_eq!(h.resolve("HEAD").await.unwrap(), Some(SyntheticHistory::rev(10)));
        assert_eq!(h.resolve("HEAD~3").await.unwrap(), Some(SyntheticHistory::rev(7)));
        assert_eq!(h.resolve("HEAD~10").await.unwrap(), None);
        assert_eq!(h.resolve("rev11").await.unwrap(), None);
    }

    #[tokio::test]
    async fn session_halves_range_until_converged() {
        let h = SyntheticHistory::new(PathBuf::from("."), 16, 9);
        let cancel = CancellationToken::new();
        let mut step = h
            .start(&SyntheticHistory::rev(1), &SyntheticHistory::rev(16))
            .await
            .unwrap();
        let found = loop {
            match step {
                BisectStep::Converged(r) => break r,
                BisectStep::Next(_) => {
                    let exit = h.run_target("t", Path::new("."), &cancel).await.unwrap();
                    let verdict = if exit == ProcessExit::Success {
                        Verdict::Good
                    } else {
                        Verdict::Bad
                    };
                    step = h.report(verdict).await.unwrap();
                }
            }
        };
        assert_eq!(found, SyntheticHistory::rev(9));
        assert_eq!(h.test_runs(), 4);
    }

    #[tokio::test]
    async fn reset_returns_to_pre_bisect_checkout() {
        let h = SyntheticHistory::new(PathBuf::from("."), 8, 5);
        h.checkout("rev8").await.unwrap();
        h.start(&SyntheticHistory::rev(1), &SyntheticHistory::rev(8))
            .await
            .unwrap();
        assert!(h.is_bisecting());
        assert_ne!(h.checked_out(), "rev8");
        h.reset().await.unwrap();
        assert!(!h.is_bisecting());
        assert_eq!(h.checked_out(), "rev8");
    }

    #[tokio::test]
    async fn report_without_session_fails() {
        let h = SyntheticHistory::new(PathBuf::from("."), 4, 2);
        let err = h.report(Verdict::Good).await.unwrap_err();
        assert!(matches!(err, BisectError::BisectToolFailure(_)));
    }
}
