use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, immutable identifier for one point in source history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for progress lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Binary result of running the test at one revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Pass,
    Fail,
}

impl ExecutionOutcome {
    pub fn is_pass(self) -> bool {
        self == ExecutionOutcome::Pass
    }

    /// The verdict reported to the bisection session for this outcome.
    pub fn verdict(self) -> Verdict {
        match self {
            ExecutionOutcome::Pass => Verdict::Good,
            ExecutionOutcome::Fail => Verdict::Bad,
        }
    }
}

/// Why a probe ended in `Fail`. Every kind counts as `Fail` for the search;
/// the distinction only shows up in logs and the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The test tool ran and exited non-zero.
    TestFailed { code: Option<i32> },
    /// The test tool could not be spawned or crashed before reporting.
    ToolCrashed { error: String },
    /// The execution environment did not come up.
    EnvironmentFailed { error: String },
    /// The working tree could not be prepared (reset or snapshot write).
    TreePreparationFailed { error: String },
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::TestFailed { code: Some(c) } => write!(f, "test failed (exit {c})"),
            FailureKind::TestFailed { code: None } => f.write_str("test failed (killed by signal)"),
            FailureKind::ToolCrashed { error } => write!(f, "test tool crashed: {error}"),
            FailureKind::EnvironmentFailed { error } => {
                write!(f, "environment failed to start: {error}")
            }
            FailureKind::TreePreparationFailed { error } => {
                write!(f, "working tree preparation failed: {error}")
            }
        }
    }
}

/// Verdict reported back to the bisection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Good,
    Bad,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Good => "good",
            Verdict::Bad => "bad",
        }
    }
}

/// Typed response of the bisection session after `start` or `report`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectStep {
    /// The session checked out a new candidate to test.
    Next(Revision),
    /// The session found the first bad revision.
    Converged(Revision),
}

/// Which part of the run a probe belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeRole {
    ValidateGood,
    ValidateBad,
    Search,
}

/// One test execution at one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub revision: Revision,
    pub role: ProbeRole,
    pub outcome: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub duration_ms: u64,
}
