use crate::vcs::Repository;
use culprit_core::{BisectError, Revision};

/// A reference resolved to a canonical revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub revision: Revision,
    /// The reference did not resolve and the root revision was used instead.
    pub fell_back: bool,
}

/// Turns user-supplied references into canonical revisions at session start.
pub struct RevisionResolver<'a> {
    repo: &'a dyn Repository,
    strict: bool,
}

impl<'a> RevisionResolver<'a> {
    pub fn new(repo: &'a dyn Repository, strict: bool) -> Self {
        Self { repo, strict }
    }

    pub async fn resolve(&self, reference: &str) -> Result<Resolved, BisectError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BisectError::InvalidInput("empty revision reference".into()));
        }
        if let Some(revision) = self.repo.resolve(reference).await? {
            tracing::debug!(reference, revision = %revision, "resolved reference");
            return Ok(Resolved {
                revision,
                fell_back: false,
            });
        }
        if !is_head_relative(reference) {
            return Err(BisectError::InvalidInput(format!(
                "cannot resolve revision '{reference}'"
            )));
        }
        if self.strict {
            return Err(BisectError::InvalidInput(format!(
                "'{reference}' reaches past the start of history"
            )));
        }
        // Usually a short history: HEAD~20 with fewer than 21 commits.
        let revision = self.repo.root_revision().await?;
        tracing::warn!(
            reference,
            revision = %revision,
            "reference does not resolve, falling back to the root revision"
        );
        Ok(Resolved {
            revision,
            fell_back: true,
        })
    }
}

/// `HEAD` itself or an offset from it (`HEAD~3`, `HEAD^`, `HEAD@{1}`).
pub fn is_head_relative(reference: &str) -> bool {
    reference == "HEAD"
        || ["HEAD~", "HEAD^", "HEAD@"]
            .iter()
            .any(|p| reference.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::synthetic::SyntheticHistory;
    use std::path::PathBuf;

    fn history() -> SyntheticHistory {
        SyntheticHistory::new(PathBuf::from("."), 10, 5)
    }

    #[test]
    fn head_relative_forms() {
        assert!(is_head_relative("HEAD"));
        assert!(is_head_relative("HEAD~20"));
        assert!(is_head_relative("HEAD^"));
        assert!(is_head_relative("HEAD@{2}"));
        assert!(!is_head_relative("HEADLESS"));
        assert!(!is_head_relative("main"));
        assert!(!is_head_relative("v1.2.0"));
    }

    #[tokio::test]
    async fn resolves_head_offsets_eagerly() {
        let repo = history();
        let resolver = RevisionResolver::new(&repo, false);
        let r = resolver.resolve("HEAD~2").await.unwrap();
        assert_eq!(r.revision, SyntheticHistory::rev(8));
        assert!(!r.fell_back);
    }

    #[tokio::test]
    async fn head_offset_past_history_falls_back_to_root() {
        let repo = history();
        let resolver = RevisionResolver::new(&repo, false);
        let r = resolver.resolve("HEAD~20").await.unwrap();
        assert_eq!(r.revision, SyntheticHistory::rev(1));
        assert!(r.fell_back);
    }

    #[tokio::test]
    async fn strict_mode_rejects_fallback() {
        let repo = history();
        let resolver = RevisionResolver::new(&repo, true);
        let err = resolver.resolve("HEAD~20").await.unwrap_err();
        assert!(matches!(err, BisectError::InvalidInput(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn unknown_named_reference_is_invalid_input() {
        let repo = history();
        let resolver = RevisionResolver::new(&repo, false);
        let err = resolver.resolve("feature/nope").await.unwrap_err();
        assert!(matches!(err, BisectError::InvalidInput(msg) if msg.contains("feature/nope")));
    }

    #[tokio::test]
    async fn empty_reference_is_invalid_input() {
        let repo = history();
        let resolver = RevisionResolver::new(&repo, false);
        assert!(matches!(
            resolver.resolve("  ").await,
            Err(BisectError::InvalidInput(_))
        ));
    }
}
