//! Run artifact layout under `<working_copy>/<artifacts_dir>/runs/<run_id>/`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::state::StateStore;
use crate::core::verification::VerificationResult;

/// Upper bound on `-<n>` suffixes tried when a run id is already taken.
const MAX_RUN_ID_SUFFIX: u32 = 100;

/// Run id in the `YYYYMMDD-HHMMSS-mmm` form (UTC, millisecond precision).
pub fn run_id_at(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S-%3f").to_string()
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
    pub build_log_path: PathBuf,
    pub summary_path: PathBuf,
}

impl RunPaths {
    pub fn new(working_copy: &Path, artifacts_dir: &str, run_id: &str) -> Self {
        let dir = working_copy.join(artifacts_dir).join("runs").join(run_id);
        Self {
            run_id: run_id.to_string(),
            build_log_path: dir.join("build.log"),
            summary_path: dir.join("summary.md"),
            dir,
        }
    }

    /// Claim a fresh run directory for a run starting at `now`.
    ///
    /// The directory is created with a non-recursive `create_dir`, so two runs
    /// can never share one; a taken id gets a `-<n>` suffix.
    pub fn reserve(working_copy: &Path, artifacts_dir: &str, now: DateTime<Utc>) -> Result<Self> {
        let runs = working_copy.join(artifacts_dir).join("runs");
        fs::create_dir_all(&runs).with_context(|| format!("create {}", runs.display()))?;

        let base = run_id_at(now);
        for n in 0..MAX_RUN_ID_SUFFIX {
            let run_id = if n == 0 {
                base.clone()
            } else {
                format!("{base}-{n}")
            };
            let run = Self::new(working_copy, artifacts_dir, &run_id);
            match fs::create_dir(&run.dir) {
                Ok(()) => return Ok(run),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("create run dir {}", run.dir.display()));
                }
            }
        }
        bail!("no free run id for {base} under {}", runs.display())
    }

    pub fn iteration(&self, attempt: u32) -> IterationPaths {
        let dir = self.dir.join(attempt.to_string());
        IterationPaths {
            verification_path: dir.join("verification.json"),
            state_path: dir.join("state.json"),
            dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub verification_path: PathBuf,
    pub state_path: PathBuf,
}

/// Snapshot one finished iteration: the verdict and the full state store.
pub fn write_iteration(
    run: &RunPaths,
    attempt: u32,
    verification: Option<&VerificationResult>,
    state: &StateStore,
) -> Result<IterationPaths> {
    let paths = run.iteration(attempt);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    write_json(&paths.verification_path, &verification)?;
    write_json(&paths.state_path, state)?;
    Ok(paths)
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_text(path, &buf)
}
