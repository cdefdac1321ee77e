//! Iterative Terraform policy remediation.
//!
//! `healer run` drives the bounded remediate/verify loop against a working
//! copy; `healer verify` runs a single verification pass.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use healer::core::policy_output::parse_policy_output_str;
use healer::core::stage::Stage;
use healer::core::state::StateStore;
use healer::exit_codes;
use healer::io::config::{CONFIG_FILE_NAME, HealerConfig, read_config, write_config};
use healer::io::log_sink::NullLogSink;
use healer::io::process::SystemCommandRunner;
use healer::io::remediator::{CommandRemediator, Remediator};
use healer::looping::run_pass;
use healer::stages::{AggregatorStage, PolicyEvaluatorStage, SyntaxValidatorStage};
use healer::workflow::{WorkflowRequest, check_preconditions, run_workflow};

#[derive(Parser)]
#[command(
    name = "healer",
    version,
    about = "Bounded remediation loop for Terraform policy violations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remediate until syntax and policy pass or the iteration ceiling is hit.
    Run {
        #[arg(long)]
        working_copy: PathBuf,
        /// Policy directory or file passed to `opa eval -d`.
        #[arg(long)]
        policy: PathBuf,
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        config: PathBuf,
        /// Override the base iteration budget (ceiling is twice this).
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Policy evaluator JSON from a failed pipeline, used as initial violations.
        #[arg(long)]
        seed_log: Option<PathBuf>,
        /// Do not create a branch or commit.
        #[arg(long)]
        no_git: bool,
    },
    /// Run one syntax + policy verification pass and print the verdict.
    Verify {
        #[arg(long)]
        working_copy: PathBuf,
        #[arg(long)]
        policy: PathBuf,
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        config: PathBuf,
    },
    /// Print violations parsed from an `opa eval -f json` output file.
    ParsePolicy { file: PathBuf },
    /// Write a default `healer.toml`.
    InitConfig {
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    healer::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FATAL);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            working_copy,
            policy,
            config,
            max_iterations,
            seed_log,
            no_git,
        } => {
            let mut cfg = read_config(&config)?;
            if let Some(max_iterations) = max_iterations {
                cfg.max_iterations = max_iterations;
            }
            if no_git {
                cfg.git.enabled = false;
            }
            cmd_run(WorkflowRequest {
                working_copy,
                policy_path: policy,
                config: cfg,
                seed_log,
            })
        }
        Command::Verify {
            working_copy,
            policy,
            config,
        } => cmd_verify(&working_copy, &policy, &config),
        Command::ParsePolicy { file } => cmd_parse_policy(&file),
        Command::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

fn cmd_run(request: WorkflowRequest) -> Result<i32> {
    check_preconditions(&request)?;
    let runner = SystemCommandRunner;
    let cfg = &request.config;
    let remediator = CommandRemediator::new(
        &runner,
        cfg.remediation.command.clone(),
        cfg.output_limit_bytes,
    )
    .context("configure remediation command")?;
    let fixer = if cfg.syntax_fix.is_configured() {
        Some(
            CommandRemediator::new(&runner, cfg.syntax_fix.command.clone(), cfg.output_limit_bytes)
                .context("configure syntax-fix command")?,
        )
    } else {
        None
    };

    let outcome = run_workflow(
        &request,
        &runner,
        &remediator,
        fixer.as_ref().map(|f| f as &dyn Remediator),
    )?;

    println!(
        "{} after {} iterations ({} errors remaining)",
        outcome.terminal.as_str(),
        outcome.iterations,
        outcome.error_count()
    );
    if let Some(branch) = &outcome.branch {
        println!("branch: {branch} (committed: {})", outcome.committed);
    }
    if let Some(err) = &outcome.commit_error {
        eprintln!("commit failed: {err}");
    }
    if outcome.pushed {
        println!("pushed to {}", cfg.git.remote);
    }
    if let Some(err) = &outcome.push_error {
        eprintln!("push failed: {err}");
    }
    if let Some(url) = &outcome.pull_request {
        println!("pull request: {url}");
    }
    if let Some(err) = &outcome.pull_request_error {
        eprintln!("pull request failed: {err}");
    }
    println!("summary: {}", outcome.summary_path.display());

    Ok(if outcome.converged() {
        exit_codes::OK
    } else {
        exit_codes::EXHAUSTED
    })
}

fn cmd_verify(working_copy: &Path, policy: &Path, config: &Path) -> Result<i32> {
    let cfg = read_config(config)?;
    cfg.validate().context("invalid configuration")?;
    if !working_copy.is_dir() {
        bail!("working copy {} is not a directory", working_copy.display());
    }
    if !policy.exists() {
        bail!("policy path {} does not exist", policy.display());
    }

    let runner = SystemCommandRunner;
    let sink = NullLogSink;
    let syntax = SyntaxValidatorStage::new(&runner, &cfg);
    let policy_stage = PolicyEvaluatorStage::new(&runner, &cfg);
    let aggregator = AggregatorStage::new(&sink);
    let stages: [&dyn Stage; 3] = [&syntax, &policy_stage, &aggregator];

    let mut state = StateStore::new(working_copy, policy);
    run_pass(&mut state, &stages, 1);
    let verification = state
        .verification()
        .context("verification pass produced no verdict")?;
    print_json(verification)?;

    Ok(if verification.build_successful() {
        exit_codes::OK
    } else {
        exit_codes::EXHAUSTED
    })
}

fn cmd_parse_policy(file: &Path) -> Result<i32> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    print_json(&parse_policy_output_str(&raw))?;
    Ok(exit_codes::OK)
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &HealerConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
