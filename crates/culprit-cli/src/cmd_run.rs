use crate::cmd_config::effective_config;
use anyhow::Result;
use culprit_conductor::environment::CommandEnvironment;
use culprit_conductor::executor::LauncherRunner;
use culprit_conductor::notify::StdoutNotifier;
use culprit_conductor::runner::{plan_run, run_bisection, BisectReport, Collaborators, Mode, RunPlan};
use culprit_conductor::vcs::git::GitCli;
use culprit_conductor::vcs::Repository;
use culprit_core::config::Overrides;
use culprit_core::ExecutionOutcome;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Bisect,
    Validate,
    DryRun,
}

/// Execute `culprit run` / `culprit validate` from `start`, anywhere inside
/// the working tree.
pub fn execute(
    start: &Path,
    launcher: &Path,
    config_file: Option<&Path>,
    overrides: &Overrides,
    action: Action,
    json: bool,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let repo = rt.block_on(GitCli::discover(start))?;
    let repo_root = repo.root().to_path_buf();
    let config = effective_config(&repo_root, config_file, overrides)?;
    let launcher = if launcher.is_relative() {
        std::env::current_dir()?.join(launcher)
    } else {
        launcher.to_path_buf()
    };

    let env = CommandEnvironment::new(config.environment.clone(), repo_root);
    let runner = LauncherRunner::new(
        launcher.clone(),
        config.test_args.clone(),
        Duration::from_secs(config.environment.grace_sec),
    );
    let notifier = StdoutNotifier;
    let c = Collaborators {
        repo: &repo,
        bisect: &repo,
        environment: &env,
        runner: &runner,
        notifier: &notifier,
    };

    if action == Action::DryRun {
        let plan = rt.block_on(plan_run(&c, &config, &launcher))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            print!("{}", format_plan(&plan));
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    // Handle Ctrl+C gracefully
    ctrlc_cancel(cancel.clone());

    let mode = match action {
        Action::Validate => Mode::ValidateOnly,
        _ => Mode::Bisect,
    };
    let report = rt.block_on(run_bisection(&c, &config, &launcher, mode, &cancel))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_report(&report));
    }
    Ok(())
}

fn format_plan(plan: &RunPlan) -> String {
    let mut out = String::from("\n[dry-run] Bisection plan\n");
    let fallback = |fell_back: bool| if fell_back { " (root fallback)" } else { "" };
    out.push_str(&format!("  Good:    {}{}\n", plan.good, fallback(plan.good_fell_back)));
    out.push_str(&format!("  Bad:     {}{}\n", plan.bad, fallback(plan.bad_fell_back)));
    out.push_str(&format!("  Target:  {}\n", plan.target));
    out.push_str(&format!("  Command: {}\n", plan.command.join(" ")));
    out.push_str(&format!("  Env up:  {}\n", plan.environment_up));
    out.push_str(&format!("  Env down: {}\n", plan.environment_down));
    if !plan.present_files.is_empty() || !plan.missing_files.is_empty() {
        out.push_str("\n  Carried files:\n");
        for f in &plan.present_files {
            out.push_str(&format!("    {f}\n"));
        }
        for f in &plan.missing_files {
            out.push_str(&format!("    {f} (missing, skipped)\n"));
        }
    }
    out
}

fn format_report(report: &BisectReport) -> String {
    let mut out = String::from("\nSummary\n");
    match &report.first_bad {
        Some(rev) => out.push_str(&format!("  First bad revision: {rev}\n")),
        None => out.push_str("  Endpoints validated: good passes, bad fails\n"),
    }
    out.push_str(&format!(
        "  Range: {}..{}\n  Probes: {} validation, {} search\n",
        report.good.short(),
        report.bad.short(),
        report.validation_probes,
        report.search_probes
    ));
    out.push('\n');
    for (i, probe) in report.probes.iter().enumerate() {
        let mark = match probe.outcome {
            ExecutionOutcome::Pass => "✓",
            ExecutionOutcome::Fail => "✗",
        };
        let detail = probe
            .failure
            .as_ref()
            .map(|k| format!(" {k}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "  {:>2}. {mark} {} {:?}{detail} ({}ms)\n",
            i + 1,
            probe.revision.short(),
            probe.role,
            probe.duration_ms
        ));
    }
    if !report.restore_failures.is_empty() {
        out.push_str(&format!(
            "\n  Restore problems (repository may not be back on {}):\n",
            report.original_ref
        ));
        for f in &report.restore_failures {
            out.push_str(&format!("    {f}\n"));
        }
    }
    out
}

fn ctrlc_cancel(cancel: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, restoring repository...");
        cancel.cancel();
    });
}
