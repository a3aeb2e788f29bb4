use anyhow::Result;
use culprit_conductor::vcs::git::GitCli;
use culprit_conductor::vcs::Repository;
use culprit_core::config::{load_config, Config, Overrides, CONFIG_FILE};
use culprit_core::BisectError;
use std::path::{Path, PathBuf};

/// Where the default config file lives: the top level of the working tree
/// containing `start`, or `start` itself outside a repository.
pub fn config_root(start: &Path) -> Result<PathBuf> {
    let rt = tokio::runtime::Runtime::new()?;
    Ok(match rt.block_on(GitCli::discover(start)) {
        Ok(repo) => repo.root().to_path_buf(),
        Err(_) => start.to_path_buf(),
    })
}

/// Defaults < config file < command-line flags. An explicitly named file
/// must exist; the default one is optional.
pub fn effective_config(
    repo_root: &Path,
    config_file: Option<&Path>,
    overrides: &Overrides,
) -> Result<Config, BisectError> {
    let (path, required) = match config_file {
        Some(p) => (p.to_path_buf(), true),
        None => (repo_root.join(CONFIG_FILE), false),
    };
    let config = load_config(&path, required)
        .map_err(|e| BisectError::InvalidInput(format!("{e:#}")))?
        .apply(overrides);
    culprit_core::config::validate_config(&config)
        .map_err(|e| BisectError::InvalidInput(format!("{e:#}")))?;
    Ok(config)
}

/// Execute `culprit config`
pub fn execute(start: &Path, config_file: Option<&Path>, overrides: &Overrides) -> Result<()> {
    let config = effective_config(&config_root(start)?, config_file, overrides)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = effective_config(dir.path(), None, &Overrides::default()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "target: //from:file\ngood: v1.0\nenvironment:\n  settle_sec: 0\n",
        )
        .unwrap();
        let overrides = Overrides {
            good: Some("v2.0".into()),
            ..Default::default()
        };
        let config = effective_config(dir.path(), None, &overrides).unwrap();
        assert_eq!(config.target, "//from:file");
        assert_eq!(config.good, "v2.0");
        assert_eq!(config.bad, "HEAD");
        assert_eq!(config.environment.settle_sec, 0);
    }

    #[test]
    fn config_is_found_at_top_level_from_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let out = std::process::Command::new("git")
            .args(["init", "--quiet"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(out.status.success());
        std::fs::write(dir.path().join(CONFIG_FILE), "target: //from:top\n").unwrap();
        let sub = dir.path().join("pkg/inner");
        std::fs::create_dir_all(&sub).unwrap();

        let root = config_root(&sub).unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
        let config = effective_config(&root, None, &Overrides::default()).unwrap();
        assert_eq!(config.target, "//from:top");
    }

    #[test]
    fn outside_repository_uses_start_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config_root(dir.path()).unwrap(), dir.path());
    }

    #[test]
    fn explicit_missing_file_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = effective_config(
            dir.path(),
            Some(&dir.path().join("nope.yaml")),
            &Overrides::default(),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn empty_target_flag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            target: Some(String::new()),
            ..Default::default()
        };
        assert!(effective_config(dir.path(), None, &overrides).is_err());
    }
}
