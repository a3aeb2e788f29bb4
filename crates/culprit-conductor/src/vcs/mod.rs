pub mod git;
pub mod parse;
pub mod synthetic;

use anyhow::Result;
use culprit_core::{BisectError, BisectStep, Revision, Verdict};
use std::path::{Path, PathBuf};

/// One uncommitted change in the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntry {
    /// Relative to the top level of the working tree.
    pub path: PathBuf,
    /// The path is tracked but deleted locally.
    pub deleted: bool,
}

/// Revision and working-tree operations of the version-control tool.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Working tree root. Every path the tool reports is relative to it.
    fn root(&self) -> &Path;

    /// Top level of the working tree containing `root()`, or `None` when
    /// `root()` is not inside a repository.
    async fn top_level(&self) -> Result<Option<PathBuf>>;

    /// Resolve a reference to a canonical revision. `Ok(None)` when the
    /// tool does not know the reference.
    async fn resolve(&self, reference: &str) -> Result<Option<Revision>>;

    /// The first (parentless) revision reachable from HEAD.
    async fn root_revision(&self) -> Result<Revision>;

    /// Branch name, or the commit id when HEAD is detached.
    async fn current_ref(&self) -> Result<String>;

    async fn head(&self) -> Result<Revision>;

    /// Forced checkout of a branch or revision.
    async fn checkout(&self, target: &str) -> Result<()>;

    /// Reset tracked files to the checked-out revision and remove `paths`
    /// where they are untracked.
    async fn discard_changes(&self, paths: &[String]) -> Result<()>;

    /// Modified, added, deleted and untracked files.
    async fn dirty_entries(&self) -> Result<Vec<DirtyEntry>>;
}

/// The tool's built-in bisection session, as a typed protocol. Each call
/// leaves the next candidate checked out or reports convergence.
#[async_trait::async_trait]
pub trait BisectSession: Send + Sync {
    async fn start(&self, good: &Revision, bad: &Revision) -> Result<BisectStep, BisectError>;

    async fn report(&self, verdict: Verdict) -> Result<BisectStep, BisectError>;

    /// End any session in progress. Safe to call when none is running.
    async fn reset(&self) -> Result<()>;
}
