//! Healer configuration stored in `healer.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default configuration file name, resolved against the current directory.
pub const CONFIG_FILE_NAME: &str = "healer.toml";

/// Healer configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealerConfig {
    /// Base iteration budget. The loop ceiling is twice this value.
    pub max_iterations: u32,

    /// Directory (relative to the working copy) that receives run artifacts.
    pub artifacts_dir: String,

    /// Truncate captured tool stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub terraform: TerraformConfig,
    pub opa: OpaConfig,
    pub remediation: CommandConfig,
    pub syntax_fix: CommandConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TerraformConfig {
    pub binary: String,
    pub validate_timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub plan_timeout_secs: u64,
    pub show_timeout_secs: u64,
    /// Binary plan file written by `terraform plan -out`.
    pub plan_file: String,
    /// JSON rendering of the plan consumed by the policy engine.
    pub plan_json_file: String,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            validate_timeout_secs: 120,
            init_timeout_secs: 300,
            plan_timeout_secs: 600,
            show_timeout_secs: 120,
            plan_file: "tfplan".to_string(),
            plan_json_file: "tfplan.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OpaConfig {
    pub binary: String,
    /// Rego query passed to `opa eval`.
    pub query: String,
    pub eval_timeout_secs: u64,
}

impl Default for OpaConfig {
    fn default() -> Self {
        Self {
            binary: "opa".to_string(),
            query: "data".to_string(),
            eval_timeout_secs: 120,
        }
    }
}

/// External capability command. An empty `command` means "not configured".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 15 * 60,
        }
    }
}

impl CommandConfig {
    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    /// Remediation branches are named `<branch_prefix>-<run_id>`.
    pub branch_prefix: String,
    pub author_name: String,
    pub author_email: String,
    /// Push the remediation branch to `remote` after a successful commit.
    pub push: bool,
    pub remote: String,
    /// Opens a pull request after a successful push, e.g. `["gh", "pr", "create"]`.
    /// Called with `--title`, `--body` and `--head` appended.
    pub pull_request: CommandConfig,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            branch_prefix: "fix/auto-heal".to_string(),
            author_name: "healer".to_string(),
            author_email: "healer@localhost".to_string(),
            push: false,
            remote: "origin".to_string(),
            pull_request: CommandConfig::default(),
        }
    }
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            artifacts_dir: ".healer".to_string(),
            output_limit_bytes: 1_000_000,
            terraform: TerraformConfig::default(),
            opa: OpaConfig::default(),
            remediation: CommandConfig::default(),
            syntax_fix: CommandConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl HealerConfig {
    /// Hard cap on loop-driver attempts: twice the configured base.
    pub fn iteration_ceiling(&self) -> u32 {
        self.max_iterations.saturating_mul(2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.artifacts_dir.trim().is_empty() {
            return Err(anyhow!("artifacts_dir must not be empty"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }

        let tf = &self.terraform;
        require_name("terraform.binary", &tf.binary)?;
        require_name("terraform.plan_file", &tf.plan_file)?;
        require_name("terraform.plan_json_file", &tf.plan_json_file)?;
        require_timeout("terraform.validate_timeout_secs", tf.validate_timeout_secs)?;
        require_timeout("terraform.init_timeout_secs", tf.init_timeout_secs)?;
        require_timeout("terraform.plan_timeout_secs", tf.plan_timeout_secs)?;
        require_timeout("terraform.show_timeout_secs", tf.show_timeout_secs)?;

        require_name("opa.binary", &self.opa.binary)?;
        require_name("opa.query", &self.opa.query)?;
        require_timeout("opa.eval_timeout_secs", self.opa.eval_timeout_secs)?;

        validate_command("remediation", &self.remediation)?;
        validate_command("syntax_fix", &self.syntax_fix)?;

        if self.git.enabled {
            require_name("git.branch_prefix", &self.git.branch_prefix)?;
            require_name("git.author_name", &self.git.author_name)?;
            require_name("git.author_email", &self.git.author_email)?;
            if self.git.push {
                require_name("git.remote", &self.git.remote)?;
            }
            validate_command("git.pull_request", &self.git.pull_request)?;
            if self.git.pull_request.is_configured() && !self.git.push {
                return Err(anyhow!("git.pull_request requires git.push = true"));
            }
        }
        Ok(())
    }
}

fn require_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field} must not be empty"));
    }
    Ok(())
}

fn require_timeout(field: &str, secs: u64) -> Result<()> {
    if secs == 0 {
        return Err(anyhow!("{field} must be > 0"));
    }
    Ok(())
}

fn validate_command(section: &str, cfg: &CommandConfig) -> Result<()> {
    if let Some(first) = cfg.command.first()
        && first.trim().is_empty()
    {
        return Err(anyhow!("{section}.command must start with a program name"));
    }
    require_timeout(&format!("{section}.timeout_secs"), cfg.timeout_secs)
}

/// Load and validate config from a TOML file.
///
/// If the file is missing, returns `HealerConfig::default()`.
pub fn load_config(path: &Path) -> Result<HealerConfig> {
    let cfg = read_config(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Parse config without validating, so callers can apply overrides first.
pub fn read_config(path: &Path) -> Result<HealerConfig> {
    if !path.exists() {
        return Ok(HealerConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HealerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
