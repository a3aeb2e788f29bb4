use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;

/// File contents captured from the working tree and written back verbatim
/// after every checkout. Paths are repository-relative and kept in capture
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTreeSnapshot {
    files: Vec<(String, Vec<u8>)>,
}

impl WorkingTreeSnapshot {
    /// Read each existing path under `root`. Missing paths are skipped with
    /// a warning; other read errors are returned.
    pub fn capture(root: &Path, paths: &[String]) -> Result<Self> {
        let mut snapshot = Self::default();
        for rel in paths {
            let full = root.join(rel);
            match std::fs::read(&full) {
                Ok(content) => {
                    tracing::info!(path = %rel, bytes = content.len(), "captured test file");
                    snapshot.insert(rel.clone(), content);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::warn!(path = %rel, "test file not found, not carried across checkouts");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("reading {}", full.display()));
                }
            }
        }
        Ok(snapshot)
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, path: String, content: Vec<u8>) {
        if let Some(slot) = self.files.iter_mut().find(|(p, _)| *p == path) {
            slot.1 = content;
        } else {
            self.files.push((path, content));
        }
    }

    /// Write every captured file under `root`, creating parent directories
    /// and overwriting whatever is there.
    pub fn apply(&self, root: &Path) -> Result<()> {
        for (rel, content) in &self.files {
            let full = root.join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::write(&full, content)
                .with_context(|| format!("writing {}", full.display()))?;
            tracing::debug!(path = %rel, "applied test file");
        }
        Ok(())
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
