use crate::vcs::parse::parse_bisect_response;
use crate::vcs::{BisectSession, DirtyEntry, Repository};
use anyhow::{bail, Context, Result};
use culprit_core::{BisectError, BisectStep, Revision, Verdict};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

/// The `git` command-line tool, run against one working tree.
pub struct GitCli {
    root: PathBuf,
    bin: PathBuf,
}

impl GitCli {
    /// `root` must be the top level of the working tree; see [`GitCli::discover`].
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            bin: PathBuf::from("git"),
        }
    }

    /// Open the working tree containing `dir`, rooted at its top level.
    pub async fn discover(dir: &Path) -> Result<Self, BisectError> {
        match top_level(Path::new("git"), dir).await? {
            Some(top) => Ok(Self::new(top)),
            None => Err(BisectError::InvalidInput(format!(
                "{} is not inside a git repository",
                dir.display()
            ))),
        }
    }

    async fn raw(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.bin)
            .args(args)
            .current_dir(&self.root)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("git not available (looked for {:?})", self.bin))
    }

    /// Run git and return trimmed stdout, failing on a non-zero status.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.raw(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git {} failed (exit {}): {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn bisect(&self, args: &[&str]) -> Result<BisectStep, BisectError> {
        let output = self.raw(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(args = ?args, stdout = %stdout.trim(), "bisect response");
        match parse_bisect_response(&stdout, &stderr, output.status.success())? {
            Some(step) => Ok(step),
            None => Ok(BisectStep::Next(self.head().await?)),
        }
    }
}

#[async_trait::async_trait]
impl Repository for GitCli {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn top_level(&self) -> Result<Option<PathBuf>> {
        top_level(&self.bin, &self.root).await
    }

    async fn resolve(&self, reference: &str) -> Result<Option<Revision>> {
        let spec = format!("{reference}^{{commit}}");
        let output = self.raw(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!id.is_empty()).then(|| Revision::new(id)))
    }

    async fn root_revision(&self) -> Result<Revision> {
        let out = self.run(&["rev-list", "--max-parents=0", "HEAD"]).await?;
        // Several roots are possible after unrelated merges; rev-list lists
        // the oldest last.
        match out.lines().last() {
            Some(id) if !id.trim().is_empty() => Ok(Revision::new(id.trim())),
            _ => bail!("repository has no root commit"),
        }
    }

    async fn current_ref(&self) -> Result<String> {
        let name = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if name == "HEAD" {
            return Ok(self.head().await?.to_string());
        }
        Ok(name)
    }

    async fn head(&self) -> Result<Revision> {
        Ok(Revision::new(self.run(&["rev-parse", "HEAD"]).await?))
    }

    async fn checkout(&self, target: &str) -> Result<()> {
        self.run(&["checkout", "--quiet", "--force", target])
            .await
            .with_context(|| format!("checking out {target}"))?;
        Ok(())
    }

    async fn discard_changes(&self, paths: &[String]) -> Result<()> {
        self.run(&["reset", "--quiet", "--hard", "HEAD"]).await?;
        if !paths.is_empty() {
            let mut args = vec!["clean", "--quiet", "--force", "--"];
            args.extend(paths.iter().map(String::as_str));
            self.run(&args).await?;
        }
        Ok(())
    }

    async fn dirty_entries(&self) -> Result<Vec<DirtyEntry>> {
        let output = self
            .raw(&["status", "--porcelain", "-z", "--untracked-files=all"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git status failed: {}", stderr.trim());
        }
        Ok(parse_porcelain_z(&output.stdout))
    }
}

#[async_trait::async_trait]
impl BisectSession for GitCli {
    async fn start(&self, good: &Revision, bad: &Revision) -> Result<BisectStep, BisectError> {
        self.bisect(&["bisect", "start", bad.as_str(), good.as_str()])
            .await
    }

    async fn report(&self, verdict: Verdict) -> Result<BisectStep, BisectError> {
        self.bisect(&["bisect", verdict.as_str()]).await
    }

    async fn reset(&self) -> Result<()> {
        self.run(&["bisect", "reset"]).await?;
        Ok(())
    }
}

async fn top_level(bin: &Path, dir: &Path) -> Result<Option<PathBuf>> {
    let output = Command::new(bin)
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .with_context(|| format!("git not available (looked for {bin:?})"))?;
    if !output.status.success() {
        return Ok(None);
    }
    let top = output.stdout.trim_ascii_end();
    Ok((!top.is_empty()).then(|| path_from_bytes(top)))
}

/// Parse `git status --porcelain -z`. Paths stay raw bytes until they become
/// a `PathBuf`, so names that are not UTF-8 survive. Renames carry the
/// original path as an extra NUL-separated field, which is skipped.
fn parse_porcelain_z(out: &[u8]) -> Vec<DirtyEntry> {
    let mut entries = Vec::new();
    let mut fields = out.split(|b| *b == 0).filter(|f| !f.is_empty());
    while let Some(field) = fields.next() {
        if field.len() < 4 {
            continue;
        }
        let (x, y) = (field[0], field[1]);
        if x == b'R' || x == b'C' {
            fields.next();
        }
        entries.push(DirtyEntry {
            path: path_from_bytes(&field[3..]),
            deleted: y == b'D' || (x == b'D' && y == b' '),
        });
    }
    entries
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    /// Repo with one commit per value, each writing `value.txt`.
    async fn repo_with_history(values: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "--quiet"]).await;
        git(dir.path(), &["config", "user.email", "test@test.com"]).await;
        git(dir.path(), &["config", "user.name", "Test"]).await;
        git(dir.path(), &["config", "commit.gpgsign", "false"]).await;
        for (i, v) in values.iter().enumerate() {
            std::fs::write(dir.path().join("value.txt"), v).unwrap();
            git(dir.path(), &["add", "."]).await;
            git(dir.path(), &["commit", "--quiet", "--allow-empty", "-m", &format!("c{}", i + 1)]).await;
        }
        dir
    }

    #[test]
    fn porcelain_modified_untracked_deleted_renamed() {
        let out = b" M src/a.rs\0?? new dir/file.txt\0 D gone.txt\0R  to.rs\0from.rs\0D  staged_rm.txt\0";
        let entries = parse_porcelain_z(out);
        assert_eq!(
            entries,
            vec![
                DirtyEntry { path: "src/a.rs".into(), deleted: false },
                DirtyEntry { path: "new dir/file.txt".into(), deleted: false },
                DirtyEntry { path: "gone.txt".into(), deleted: true },
                DirtyEntry { path: "to.rs".into(), deleted: false },
                DirtyEntry { path: "staged_rm.txt".into(), deleted: true },
            ]
        );
    }

    #[tokio::test]
    async fn resolves_head_relative_and_root() {
        let dir = repo_with_history(&["1", "2", "3"]).await;
        let repo = GitCli::new(dir.path().to_path_buf());
        assert_eq!(
            repo.top_level().await.unwrap().unwrap(),
            dir.path().canonicalize().unwrap()
        );

        let head = repo.resolve("HEAD").await.unwrap().unwrap();
        let root = repo.resolve("HEAD~2").await.unwrap().unwrap();
        assert_eq!(repo.head().await.unwrap(), head);
        assert_eq!(repo.root_revision().await.unwrap(), root);
        assert_eq!(head.as_str().len(), 40);
        assert!(repo.resolve("HEAD~20").await.unwrap().is_none());
        assert!(repo.resolve("no-such-branch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitCli::new(dir.path().to_path_buf());
        assert!(repo.top_level().await.unwrap().is_none());
        let err = GitCli::discover(dir.path()).await.err().unwrap();
        assert!(matches!(err, BisectError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn discover_from_subdirectory_roots_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "--quiet"]).await;
        let sub = dir.path().join("a/b");
        std::fs::create_dir_all(&sub).unwrap();
        let repo = GitCli::discover(&sub).await.unwrap();
        assert_eq!(repo.root(), dir.path().canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn porcelain_keeps_non_utf8_names() {
        use std::os::unix::ffi::OsStrExt;
        let entries = parse_porcelain_z(b"?? caf\xe9.txt\0");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path.as_os_str().as_bytes(), b"caf\xe9.txt");
    }

    #[tokio::test]
    async fn current_ref_is_branch_or_detached_commit() {
        let dir = repo_with_history(&["1", "2"]).await;
        let repo = GitCli::new(dir.path().to_path_buf());
        let branch = repo.current_ref().await.unwrap();
        assert_ne!(branch, "HEAD");

        let first = repo.resolve("HEAD~1").await.unwrap().unwrap();
        repo.checkout(first.as_str()).await.unwrap();
        assert_eq!(repo.current_ref().await.unwrap(), first.to_string());

        repo.checkout(&branch).await.unwrap();
        assert_eq!(repo.current_ref().await.unwrap(), branch);
    }

    #[tokio::test]
    async fn discard_resets_tracked_and_cleans_listed_untracked() {
        let dir = repo_with_history(&["1"]).await;
        let repo = GitCli::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("value.txt"), "dirty").unwrap();
        std::fs::write(dir.path().join("carried.txt"), "x").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let dirty = repo.dirty_entries().await.unwrap();
        assert_eq!(dirty.len(), 3);

        repo.discard_changes(&["carried.txt".into()]).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("value.txt")).unwrap(), "1");
        assert!(!dir.path().join("carried.txt").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn bisect_protocol_converges_on_first_bad() {
        // c1..c8, broken from c5 onward.
        let dir = repo_with_history(&["ok", "ok", "ok", "ok", "bad", "bad", "bad", "bad"]).await;
        let repo = GitCli::new(dir.path().to_path_buf());
        let good = repo.resolve("HEAD~7").await.unwrap().unwrap();
        let bad = repo.resolve("HEAD").await.unwrap().unwrap();
        let expected = repo.resolve("HEAD~3").await.unwrap().unwrap();

        let mut step = repo.start(&good, &bad).await.unwrap();
        let mut probes = 0;
        let found = loop {
            match step {
                BisectStep::Converged(rev) => break rev,
                BisectStep::Next(rev) => {
                    probes += 1;
                    assert_eq!(repo.head().await.unwrap(), rev);
                    let value = std::fs::read_to_string(dir.path().join("value.txt")).unwrap();
                    let verdict = if value == "ok" { Verdict::Good } else { Verdict::Bad };
                    step = repo.report(verdict).await.unwrap();
                }
            }
        };
        assert_eq!(found, expected);
        assert!(probes <= 3, "took {probes} probes");
        repo.reset().await.unwrap();
    }

    #[tokio::test]
    async fn bisect_adjacent_endpoints_converge_immediately() {
        let dir = repo_with_history(&["ok", "bad"]).await;
        let repo = GitCli::new(dir.path().to_path_buf());
        let good = repo.resolve("HEAD~1").await.unwrap().unwrap();
        let bad = repo.resolve("HEAD").await.unwrap().unwrap();
        let step = repo.start(&good, &bad).await.unwrap();
        assert_eq!(step, BisectStep::Converged(bad));
        repo.reset().await.unwrap();
    }

    #[tokio::test]
    async fn reset_without_session_is_ok() {
        let dir = repo_with_history(&["1"]).await;
        let repo = GitCli::new(dir.path().to_path_buf());
        repo.reset().await.unwrap();
    }
}
