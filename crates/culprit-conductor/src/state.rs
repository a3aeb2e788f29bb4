use anyhow::{bail, Result};
use culprit_core::{Probe, ProbeRole, Revision};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::snapshot::WorkingTreeSnapshot;

// ── Status ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BisectStatus {
    Validating,
    Bisecting,
    Converged,
    Aborted,
}

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(BisectStatus, &[BisectStatus])] = &[
    (
        BisectStatus::Validating,
        &[BisectStatus::Bisecting, BisectStatus::Aborted],
    ),
    (
        BisectStatus::Bisecting,
        &[BisectStatus::Converged, BisectStatus::Aborted],
    ),
    // Converged and Aborted are terminal
];

fn is_valid_transition(from: BisectStatus, to: BisectStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

// ── Session ──

/// Everything the controller knows about the run in progress. Lives for one
/// process and is never persisted.
#[derive(Debug, Clone)]
pub struct BisectionSession {
    /// Branch (or detached commit) checked out when the run started.
    pub original_ref: String,
    pub good: Revision,
    pub bad: Revision,
    pub snapshot: Arc<WorkingTreeSnapshot>,
    pub status: BisectStatus,
    /// Candidate currently checked out, if any.
    pub current: Option<Revision>,
    pub first_bad: Option<Revision>,
    pub probes: Vec<Probe>,
    pub started_at: String,
}

impl BisectionSession {
    pub fn new(
        original_ref: String,
        good: Revision,
        bad: Revision,
        snapshot: Arc<WorkingTreeSnapshot>,
    ) -> Self {
        Self {
            original_ref,
            good,
            bad,
            snapshot,
            status: BisectStatus::Validating,
            current: None,
            first_bad: None,
            probes: Vec::new(),
            started_at: now_rfc3339(),
        }
    }

    /// Move to `to`, rejecting moves the state machine does not allow.
    pub fn transition(&mut self, to: BisectStatus) -> Result<()> {
        if !is_valid_transition(self.status, to) {
            bail!("invalid transition: {:?} → {to:?}", self.status);
        }
        tracing::debug!(from = ?self.status, to = ?to, "session transition");
        self.status = to;
        Ok(())
    }

    /// Abort from any non-terminal state. A no-op once terminal.
    pub fn abort(&mut self) {
        if is_valid_transition(self.status, BisectStatus::Aborted) {
            self.status = BisectStatus::Aborted;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, BisectStatus::Converged | BisectStatus::Aborted)
    }

    pub fn record(&mut self, probe: Probe) {
        self.probes.push(probe);
    }

    pub fn search_probes(&self) -> usize {
        self.probes
            .iter()
            .filter(|p| p.role == ProbeRole::Search)
            .count()
    }

    pub fn validation_probes(&self) -> usize {
        self.probes.len() - self.search_probes()
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
