mod cmd_config;
mod cmd_run;

use clap::{Args, Parser, Subcommand};
use culprit_core::config::Overrides;
use culprit_core::BisectError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "culprit",
    version,
    about = "Find the first revision that broke a test"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
    /// Repository to operate on (default: current directory)
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
    /// Debug-level logging (CULPRIT_LOG / RUST_LOG still take precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Validate both endpoints, then bisect to the first bad revision
    Run {
        #[command(flatten)]
        run: RunArgs,
        /// Resolve and validate inputs, print the plan, touch nothing
        #[arg(long)]
        dry_run: bool,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check inputs and that good passes and bad fails, without searching
    Validate {
        #[command(flatten)]
        run: RunArgs,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as YAML
    Config {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the build/test launcher (e.g. bazelisk)
    #[arg(short = 'z', long)]
    launcher: PathBuf,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct SessionArgs {
    /// Known-good reference [config default: HEAD~20]
    #[arg(short, long)]
    good: Option<String>,
    /// Known-bad reference [config default: HEAD]
    #[arg(short, long)]
    bad: Option<String>,
    /// Build/test target to run at every revision
    #[arg(long)]
    target: Option<String>,
    /// Config file (default: culprit.yaml at the repository root, if present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Fail instead of falling back to the root revision when a HEAD-relative
    /// reference does not resolve
    #[arg(long)]
    strict_refs: bool,
}

impl SessionArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            target: self.target.clone(),
            good: self.good.clone(),
            bad: self.bad.clone(),
            strict_refs: self.strict_refs,
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};

    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let builder = EnvFilter::builder().with_default_directive(default.into());
    // CULPRIT_LOG wins over RUST_LOG.
    let filter = if std::env::var_os("CULPRIT_LOG").is_some() {
        builder.with_env_var("CULPRIT_LOG").from_env_lossy()
    } else {
        builder.from_env_lossy()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let start = match cli.cwd {
        Some(dir) => std::fs::canonicalize(&dir)
            .map_err(|e| BisectError::InvalidInput(format!("{}: {e}", dir.display())))?,
        None => std::env::current_dir()?,
    };

    match cli.cmd {
        Command::Run { run, dry_run, json } => cmd_run::execute(
            &start,
            &run.launcher,
            run.session.config.as_deref(),
            &run.session.overrides(),
            if dry_run {
                cmd_run::Action::DryRun
            } else {
                cmd_run::Action::Bisect
            },
            json,
        ),
        Command::Validate { run, json } => cmd_run::execute(
            &start,
            &run.launcher,
            run.session.config.as_deref(),
            &run.session.overrides(),
            cmd_run::Action::Validate,
            json,
        ),
        Command::Config { session } => cmd_config::execute(
            &start,
            session.config.as_deref(),
            &session.overrides(),
        ),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        let code = e
            .downcast_ref::<BisectError>()
            .map_or(1, BisectError::exit_code);
        eprintln!("Error: {e:#}");
        std::process::exit(code);
    }
}
