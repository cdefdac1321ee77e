//! Command lines for the terraform and opa invocations used by the loop.

use std::path::Path;
use std::time::Duration;

use crate::io::config::HealerConfig;
use crate::io::process::CommandRequest;

/// Builds terraform requests rooted at one working copy.
#[derive(Debug, Clone)]
pub struct Terraform<'a> {
    config: &'a HealerConfig,
    workdir: &'a Path,
}

impl<'a> Terraform<'a> {
    pub fn new(config: &'a HealerConfig, workdir: &'a Path) -> Self {
        Self { config, workdir }
    }

    fn request(&self, timeout_secs: u64) -> CommandRequest {
        CommandRequest::new(
            &self.config.terraform.binary,
            self.workdir,
            Duration::from_secs(timeout_secs),
            self.config.output_limit_bytes,
        )
    }

    pub fn validate(&self) -> CommandRequest {
        self.request(self.config.terraform.validate_timeout_secs)
            .args(["validate", "-json", "-no-color"])
    }

    pub fn init(&self) -> CommandRequest {
        self.request(self.config.terraform.init_timeout_secs)
            .args(["init", "-input=false", "-no-color"])
    }

    pub fn plan(&self) -> CommandRequest {
        self.request(self.config.terraform.plan_timeout_secs).args([
            "plan".to_string(),
            format!("-out={}", self.config.terraform.plan_file),
            "-input=false".to_string(),
            "-no-color".to_string(),
        ])
    }

    pub fn show_json(&self) -> CommandRequest {
        self.request(self.config.terraform.show_timeout_secs).args([
            "show",
            "-json",
            self.config.terraform.plan_file.as_str(),
        ])
    }

    /// Location of the JSON plan written after `show`.
    pub fn plan_json_path(&self) -> std::path::PathBuf {
        self.workdir.join(&self.config.terraform.plan_json_file)
    }
}

/// Build the `opa eval` request for a serialized plan.
pub fn opa_eval(config: &HealerConfig, workdir: &Path, policy_path: &Path) -> CommandRequest {
    CommandRequest::new(
        &config.opa.binary,
        workdir,
        Duration::from_secs(config.opa.eval_timeout_secs),
        config.output_limit_bytes,
    )
    .args([
        "eval".to_string(),
        "-i".to_string(),
        config.terraform.plan_json_file.clone(),
        "-d".to_string(),
        policy_path.display().to_string(),
        config.opa.query.clone(),
        "-f".to_string(),
        "json".to_string(),
    ])
}
