use crate::vcs::Repository;
use culprit_core::BisectError;
use std::path::Path;

/// Checks that must pass before the working tree is touched: the repository
/// is rooted at the top level of its working tree and the launcher exists
/// and is executable. Endpoint references are verified separately by the
/// resolver.
pub async fn validate_inputs(repo: &dyn Repository, launcher: &Path) -> Result<(), BisectError> {
    let root = repo.root();
    let Some(top) = repo.top_level().await? else {
        return Err(BisectError::InvalidInput(format!(
            "{} is not inside a git repository",
            root.display()
        )));
    };
    // Status paths are relative to the top level, and bisect refuses to run
    // anywhere else.
    if !same_dir(root, &top) {
        return Err(BisectError::InvalidInput(format!(
            "{} is not the top level of its working tree ({})",
            root.display(),
            top.display()
        )));
    }
    check_launcher(launcher)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

pub fn check_launcher(launcher: &Path) -> Result<(), BisectError> {
    let meta = std::fs::metadata(launcher).map_err(|_| {
        BisectError::InvalidInput(format!("launcher not found: {}", launcher.display()))
    })?;
    if !meta.is_file() {
        return Err(BisectError::InvalidInput(format!(
            "launcher is not a file: {}",
            launcher.display()
        )));
    }
    if !is_executable(&meta) {
        return Err(BisectError::InvalidInput(format!(
            "launcher is not executable: {}",
            launcher.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}
