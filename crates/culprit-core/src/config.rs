use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default config file name, looked up at the repository root.
pub const CONFIG_FILE: &str = "culprit.yaml";

/// Upper bound for every wait in `environment`, in seconds (one day).
pub const MAX_WAIT_SEC: u64 = 86_400;

/// Effective settings for one bisection run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Single build/test target handed to the launcher.
    #[serde(default = "default_target")]
    pub target: String,
    /// Repository-relative files carried across every checkout.
    #[serde(default = "default_test_files")]
    pub test_files: Vec<String>,
    /// Launcher arguments; the target is appended last.
    #[serde(default = "default_test_args")]
    pub test_args: Vec<String>,
    #[serde(default = "default_good")]
    pub good: String,
    #[serde(default = "default_bad")]
    pub bad: String,
    /// Fail on unresolvable head-relative references instead of falling
    /// back to the root revision.
    #[serde(default)]
    pub strict_refs: bool,
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

/// Shell commands that manage the ephemeral services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default = "default_up")]
    pub up: String,
    #[serde(default = "default_down")]
    pub down: String,
    /// Run when `down` fails or overruns the grace period.
    #[serde(default)]
    pub force_down: Option<String>,
    #[serde(default = "default_settle_sec")]
    pub settle_sec: u64,
    /// Polled after the settle delay until it exits zero.
    #[serde(default)]
    pub ready_cmd: Option<String>,
    #[serde(default = "default_ready_interval")]
    pub ready_interval_sec: u64,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_sec: u64,
    /// How long processes get to stop on their own after an interrupt.
    #[serde(default = "default_grace_sec")]
    pub grace_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: default_target(),
            test_files: default_test_files(),
            test_args: default_test_args(),
            good: default_good(),
            bad: default_bad(),
            strict_refs: false,
            environment: EnvironmentConfig::default(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            up: default_up(),
            down: default_down(),
            force_down: None,
            settle_sec: default_settle_sec(),
            ready_cmd: None,
            ready_interval_sec: default_ready_interval(),
            ready_timeout_sec: default_ready_timeout(),
            grace_sec: default_grace_sec(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target: Option<String>,
    pub good: Option<String>,
    pub bad: Option<String>,
    pub strict_refs: bool,
}

impl Config {
    pub fn apply(mut self, overrides: &Overrides) -> Self {
        if let Some(t) = &overrides.target {
            self.target = t.clone();
        }
        if let Some(g) = &overrides.good {
            self.good = g.clone();
        }
        if let Some(b) = &overrides.bad {
            self.bad = b.clone();
        }
        if overrides.strict_refs {
            self.strict_refs = true;
        }
        self
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing config")
    }
}

/// Load config from `path`, or defaults when the file does not exist and
/// was not explicitly requested.
pub fn load_config(path: &Path, required: bool) -> Result<Config> {
    if !path.exists() {
        if required {
            bail!("config file not found: {}", path.display());
        }
        return Ok(Config::default());
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_config(&content).with_context(|| format!("loading {}", path.display()))
}

/// Parse and validate config from a YAML string. An empty document yields
/// the defaults.
pub fn parse_config(yaml: &str) -> Result<Config> {
    let config: Config = if yaml.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(yaml).context("config schema validation failed")?
    };
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.target.trim().is_empty() {
        bail!("target must not be empty");
    }
    if config.good.trim().is_empty() || config.bad.trim().is_empty() {
        bail!("good and bad references must not be empty");
    }
    for f in &config.test_files {
        let p = Path::new(f);
        if p.is_absolute() || p.components().any(|c| c.as_os_str() == "..") {
            bail!("test file must be repository-relative: \"{f}\"");
        }
    }
    let env = &config.environment;
    if env.up.trim().is_empty() || env.down.trim().is_empty() {
        bail!("environment.up and environment.down must not be empty");
    }
    if env.grace_sec == 0 {
        bail!("environment.grace_sec must be at least 1");
    }
    if env.ready_cmd.is_some() && env.ready_interval_sec == 0 {
        bail!("environment.ready_interval_sec must be at least 1");
    }
    for (name, value) in [
        ("settle_sec", env.settle_sec),
        ("ready_interval_sec", env.ready_interval_sec),
        ("ready_timeout_sec", env.ready_timeout_sec),
        ("grace_sec", env.grace_sec),
    ] {
        if value > MAX_WAIT_SEC {
            bail!("environment.{name} must be at most {MAX_WAIT_SEC}, got {value}");
        }
    }
    Ok(())
}

fn default_target() -> String {
    "src/test/integration/java/com/xgen/mongot/index:TestQueryIntegrationSubset".into()
}
fn default_test_files() -> Vec<String> {
    vec![
        "src/test/integration/java/com/xgen/mongot/index/TestQueryIntegrationSubset.java".into(),
        "src/test/integration/resources/index/bisection.json".into(),
    ]
}
fn default_test_args() -> Vec<String> {
    vec!["test".into(), "--test_output=errors".into()]
}
fn default_good() -> String {
    "HEAD~20".into()
}
fn default_bad() -> String {
    "HEAD".into()
}
fn default_up() -> String {
    "make docker.up".into()
}
fn default_down() -> String {
    "make docker.down".into()
}
fn default_settle_sec() -> u64 {
    5
}
fn default_ready_interval() -> u64 {
    2
}
fn default_ready_timeout() -> u64 {
    120
}
fn default_grace_sec() -> u64 {
    30
}
