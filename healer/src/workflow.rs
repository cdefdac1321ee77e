//! Outer pipeline: preconditions, analyze, setup, remediation loop, finalize.
//!
//! Every fatal condition is checked before the first stage runs. Once the loop
//! starts, tool and capability failures are data recorded in the state store,
//! and git problems during finalize only downgrade the outcome.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::policy_output::parse_policy_output;
use crate::core::stage::Stage;
use crate::core::state::StateStore;
use crate::core::types::EvaluationResult;
use crate::core::verification::VerificationResult;
use crate::io::config::HealerConfig;
use crate::io::files::declarative_files;
use crate::io::git::{CommitAuthor, Git, ensure_gitignore_entries};
use crate::io::iteration_log::{RunPaths, write_iteration};
use crate::io::log_sink::FileLogSink;
use crate::io::process::{CommandRequest, CommandRunner, execute_checked};
use crate::io::remediator::Remediator;
use crate::looping::{LoopTerminal, run_loop};
use crate::report::{ReportInputs, render_commit_message, write_summary};
use crate::stages::{
    AggregatorStage, DecisionStage, PolicyEvaluatorStage, RemediateStage, SyntaxFixStage,
    SyntaxValidatorStage,
};

/// Inputs for one workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub working_copy: PathBuf,
    pub policy_path: PathBuf,
    pub config: HealerConfig,
    /// Optional policy evaluator output from a failed pipeline run.
    pub seed_log: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub run_id: String,
    pub terminal: LoopTerminal,
    pub iterations: u32,
    pub verification_passes: u32,
    pub verification: Option<VerificationResult>,
    /// Branch created during setup, when git was used.
    pub branch: Option<String>,
    pub committed: bool,
    /// Set when finalize could not commit.
    pub commit_error: Option<String>,
    /// The branch reached `git.remote`.
    pub pushed: bool,
    pub push_error: Option<String>,
    /// Whatever the pull request command printed last, usually its URL.
    pub pull_request: Option<String>,
    pub pull_request_error: Option<String>,
    pub summary_path: PathBuf,
}

impl WorkflowOutcome {
    pub fn converged(&self) -> bool {
        self.terminal == LoopTerminal::Converged
    }

    pub fn error_count(&self) -> usize {
        self.verification
            .as_ref()
            .map_or(0, VerificationResult::error_count)
    }
}

/// Run the full pipeline against `request.working_copy`.
///
/// Returns `Err` only for fatal conditions: failed preconditions, setup git
/// failures, or an unwritable summary. An exhausted loop is an `Ok` outcome.
#[instrument(skip_all, fields(working_copy = %request.working_copy.display()))]
pub fn run_workflow(
    request: &WorkflowRequest,
    runner: &dyn CommandRunner,
    remediator: &dyn Remediator,
    syntax_fixer: Option<&dyn Remediator>,
) -> Result<WorkflowOutcome> {
    let config = &request.config;
    check_preconditions(request)?;

    let mut state = StateStore::new(&request.working_copy, &request.policy_path);
    if let Some(seed_log) = &request.seed_log {
        analyze_seed_log(&mut state, seed_log)?;
    }

    let run = RunPaths::reserve(&request.working_copy, &config.artifacts_dir, Utc::now())?;
    let run_id = run.run_id.clone();
    let git = setup_git(request, &run_id)?;
    info!(run_id = %run_id, branch = ?git.as_ref().map(|(_, b)| b), "workflow setup complete");

    let build_log = FileLogSink::new(&run.build_log_path);
    let remediate = RemediateStage::new(remediator, config, Some(run.dir.clone()));
    let syntax_fix = SyntaxFixStage::new(syntax_fixer, runner, config, Some(run.dir.clone()));
    let syntax = SyntaxValidatorStage::new(runner, config);
    let policy = PolicyEvaluatorStage::new(runner, config);
    let aggregator = AggregatorStage::new(&build_log);
    let stages: [&dyn Stage; 6] = [
        &remediate,
        &syntax_fix,
        &syntax,
        &policy,
        &aggregator,
        &DecisionStage,
    ];

    let ceiling = config.iteration_ceiling();
    let outcome = run_loop(&mut state, &stages, ceiling, |attempt, state| {
        if let Err(err) = write_iteration(&run, attempt, state.verification(), state) {
            warn!(attempt, err = %format!("{err:#}"), "failed to write iteration snapshot");
        }
    })?;

    let branch = git.as_ref().map(|(_, branch)| branch.as_str());
    let inputs = ReportInputs {
        run_id: &run_id,
        ceiling,
        branch,
        outcome: &outcome,
        state: &state,
    };
    write_summary(&run.summary_path, &inputs).context("write run summary")?;

    let mut committed = false;
    let mut commit_error = None;
    if let Some((git, _)) = &git {
        match commit_changes(git, config, &inputs) {
            Ok(did_commit) => committed = did_commit,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "finalize commit failed");
                commit_error = Some(message);
            }
        }
    }

    let mut publication = Publication::default();
    if let Some((git, branch)) = &git
        && committed
        && config.git.push
    {
        publication = publish(git, branch, runner, request, &inputs);
    }

    info!(
        terminal = outcome.terminal.as_str(),
        iterations = outcome.iterations,
        committed,
        pushed = publication.pushed,
        "workflow finished"
    );
    Ok(WorkflowOutcome {
        run_id,
        terminal: outcome.terminal,
        iterations: outcome.iterations,
        verification_passes: outcome.verification_passes,
        verification: outcome.verification,
        branch: git.map(|(_, branch)| branch),
        committed,
        commit_error,
        pushed: publication.pushed,
        push_error: publication.push_error,
        pull_request: publication.pull_request,
        pull_request_error: publication.pull_request_error,
        summary_path: run.summary_path,
    })
}

/// Fatal checks that must hold before any stage runs.
pub fn check_preconditions(request: &WorkflowRequest) -> Result<()> {
    let config = &request.config;
    config.validate().context("invalid configuration")?;

    let wc = &request.working_copy;
    if !wc.is_dir() {
        return Err(anyhow!("working copy {} is not a directory", wc.display()));
    }
    if declarative_files(wc, &config.artifacts_dir).is_empty() {
        return Err(anyhow!("working copy {} contains no .tf files", wc.display()));
    }
    if !request.policy_path.exists() {
        return Err(anyhow!(
            "policy path {} does not exist",
            request.policy_path.display()
        ));
    }
    if !config.remediation.is_configured() {
        return Err(anyhow!("no remediation command configured"));
    }
    Ok(())
}

/// Seed the state with violations from a previous evaluator run.
///
/// Non-JSON content is ignored with a warning; an unreadable file is fatal.
fn analyze_seed_log(state: &mut StateStore, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read seed log {}", path.display()))?;
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => {
            let violations = parse_policy_output(&value);
            info!(violations = violations.len(), "seeded violations from log");
            state.record_evaluation(EvaluationResult::seeded(value, violations));
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "seed log is not policy JSON, ignoring");
        }
    }
    Ok(())
}

/// Create the remediation branch and ignore tool byproducts.
///
/// Returns `None` when git is disabled or the working copy is not a repository.
fn setup_git(request: &WorkflowRequest, run_id: &str) -> Result<Option<(Git, String)>> {
    let config = &request.config;
    if !config.git.enabled {
        debug!("git disabled");
        return Ok(None);
    }
    let git = Git::new(&request.working_copy);
    if !git.is_repository() {
        warn!("working copy is not a git repository, skipping branch and commit");
        return Ok(None);
    }

    let branch = format!("{}-{run_id}", config.git.branch_prefix);
    git.checkout_new_branch(&branch)
        .with_context(|| format!("create branch {branch}"))?;

    let tf = &config.terraform;
    let artifacts = format!("{}/", config.artifacts_dir.trim_end_matches('/'));
    let entries = [
        ".terraform/",
        ".terraform.lock.hcl",
        tf.plan_file.as_str(),
        tf.plan_json_file.as_str(),
        artifacts.as_str(),
    ];
    ensure_gitignore_entries(&request.working_copy, &entries).context("update .gitignore")?;
    Ok(Some((git, branch)))
}

fn commit_changes(git: &Git, config: &HealerConfig, inputs: &ReportInputs<'_>) -> Result<bool> {
    let message = render_commit_message(inputs)?;
    git.add_all()?;
    let author = CommitAuthor {
        name: config.git.author_name.clone(),
        email: config.git.author_email.clone(),
    };
    git.commit_staged(&message, &author)
}

#[derive(Debug, Default)]
struct Publication {
    pushed: bool,
    push_error: Option<String>,
    pull_request: Option<String>,
    pull_request_error: Option<String>,
}

/// Push the committed branch and open a pull request when configured.
///
/// Failures are recorded in the result and never abort the run.
fn publish(
    git: &Git,
    branch: &str,
    runner: &dyn CommandRunner,
    request: &WorkflowRequest,
    inputs: &ReportInputs<'_>,
) -> Publication {
    let git_config = &request.config.git;
    let mut publication = Publication::default();
    if let Err(err) = git.push(&git_config.remote, branch) {
        let message = format!("{err:#}");
        warn!(err = %message, remote = %git_config.remote, "push failed");
        publication.push_error = Some(message);
        return publication;
    }
    publication.pushed = true;

    if git_config.pull_request.is_configured() {
        match open_pull_request(runner, request, branch, inputs) {
            Ok(url) => {
                info!(url = %url, "opened pull request");
                publication.pull_request = Some(url);
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "pull request failed");
                publication.pull_request_error = Some(message);
            }
        }
    }
    publication
}

/// Run the pull request command with the commit subject as title and the
/// commit body as description.
fn open_pull_request(
    runner: &dyn CommandRunner,
    request: &WorkflowRequest,
    branch: &str,
    inputs: &ReportInputs<'_>,
) -> Result<String> {
    let config = &request.config;
    let Some((program, args)) = config.git.pull_request.command.split_first() else {
        return Err(anyhow!("no pull request command configured"));
    };
    let message = render_commit_message(inputs)?;
    let (title, body) = message.split_once('\n').unwrap_or((message.as_str(), ""));

    let command = CommandRequest::new(
        program,
        &request.working_copy,
        config.git.pull_request.timeout(),
        config.output_limit_bytes,
    )
    .args(args.iter().cloned())
    .args(["--title", title.trim(), "--body", body.trim(), "--head", branch]);
    let output = execute_checked(runner, &command).map_err(|failure| anyhow!(failure.message))?;

    let stdout = output.stdout_text();
    Ok(stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string())
}
