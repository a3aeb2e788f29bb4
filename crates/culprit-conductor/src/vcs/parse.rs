//! Reading `git bisect` responses into typed steps.

use culprit_core::{BisectError, BisectStep, Revision};
use regex::Regex;
use std::sync::OnceLock;

/// Marker git prints once the search has converged.
pub const FIRST_BAD_SENTINEL: &str = "is the first bad commit";

fn first_bad_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^([0-9a-f]{7,64}) is the first bad commit").expect("valid regex")
    })
}

fn candidate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\[([0-9a-f]{7,64})\]").expect("valid regex"))
}

/// Interpret the output of `git bisect start|good|bad`.
///
/// Convergence wins over the exit status. Otherwise a non-zero status is a
/// tool failure. A successful response without a candidate line yields
/// `Ok(None)`; the caller then reads HEAD.
pub fn parse_bisect_response(
    stdout: &str,
    stderr: &str,
    success: bool,
) -> Result<Option<BisectStep>, BisectError> {
    if let Some(caps) = first_bad_re().captures(stdout) {
        return Ok(Some(BisectStep::Converged(Revision::new(&caps[1]))));
    }
    if stdout.contains(FIRST_BAD_SENTINEL) {
        return Err(BisectError::BisectToolFailure(format!(
            "completion reported without a revision: {}",
            stdout.trim()
        )));
    }
    if !success {
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        return Err(BisectError::BisectToolFailure(detail.to_string()));
    }
    Ok(candidate_re()
        .captures(stdout)
        .map(|caps| BisectStep::Next(Revision::new(&caps[1]))))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA_A: &str = "3f2c1e0b9a8d7c6b5a4f3e2d1c0b9a8f7e6d5c4b";
    const SHA_B: &str = "aa11bb22cc33dd44ee55ff6677889900aabbccdd";

    #[test]
    fn next_candidate_from_bisecting_line() {
        let out = format!(
            "Bisecting: 6 revisions left to test after this (roughly 3 steps)\n[{SHA_A}] Fix flaky index test\n"
        );
        let step = parse_bisect_response(&out, "", true).unwrap();
        assert_eq!(step, Some(BisectStep::Next(Revision::new(SHA_A))));
    }

    #[test]
    fn converged_with_revision_from_sentinel_line() {
        let out = format!(
            "{SHA_B} is the first bad commit\ncommit {SHA_B}\nAuthor: Dev <dev@example.com>\n\n    Break query planner\n"
        );
        let step = parse_bisect_response(&out, "", true).unwrap();
        assert_eq!(step, Some(BisectStep::Converged(Revision::new(SHA_B))));
    }

    #[test]
    fn converged_even_with_nonzero_status() {
        let out = format!("{SHA_B} is the first bad commit\n");
        let step = parse_bisect_response(&out, "warning", false).unwrap();
        assert!(matches!(step, Some(BisectStep::Converged(_))));
    }

    #[test]
    fn nonzero_status_without_sentinel_is_tool_failure() {
        let err = parse_bisect_response("", "fatal: bad revision 'zzz'\n", false).unwrap_err();
        match err {
            BisectError::BisectToolFailure(msg) => assert!(msg.contains("bad revision")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn success_without_candidate_is_none() {
        let step = parse_bisect_response("status: waiting for good commit(s)\n", "", true).unwrap();
        assert!(step.is_none());
    }

    #[test]
    fn sentinel_without_revision_is_tool_failure() {
        let err = parse_bisect_response("HEAD is the first bad commit\n", "", true).unwrap_err();
        assert!(matches!(err, BisectError::BisectToolFailure(_)));
    }
}
