//! Git adapter for the workflow's setup and finalize phases.
//!
//! A small, explicit wrapper around `git` subprocess calls.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Identity used for remediation commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True when the working directory is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(err) => {
                warn!(err = %err, "git unavailable");
                false
            }
        }
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message as the given author.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str, author: &CommitAuthor) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!(author = %author.name, "committing staged changes");
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.run_checked(&["-c", &name, "-c", &email, "commit", "-m", message])?;
        Ok(true)
    }

    /// Push `branch` to `remote` and set it as upstream.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        debug!(remote, branch, "pushing branch");
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Append any missing `entries` to `<workdir>/.gitignore`.
///
/// Returns true when the file changed.
pub fn ensure_gitignore_entries(workdir: &Path, entries: &[&str]) -> Result<bool> {
    let path = workdir.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };

    let missing: Vec<&str> = entries
        .iter()
        .copied()
        .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    for entry in &missing {
        contents.push_str(entry);
        contents.push('\n');
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    debug!(added = missing.len(), "updated .gitignore");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gitignore_entries_are_added_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(".gitignore"), "target/\n.terraform/").expect("write");

        let changed =
            ensure_gitignore_entries(temp.path(), &[".terraform/", "tfplan"]).expect("ensure");
        assert!(changed);
        let contents = fs::read_to_string(temp.path().join(".gitignore")).expect("read");
        assert_eq!(contents, "target/\n.terraform/\ntfplan\n");

        let changed =
            ensure_gitignore_entries(temp.path(), &[".terraform/", "tfplan"]).expect("ensure");
        assert!(!changed);
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn push_publishes_branch_to_remote() {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = temp.path().join("remote.git");
        let work = temp.path().join("work");
        fs::create_dir(&work).expect("mkdir");
        git(temp.path(), &["init", "-q", "--bare", "remote.git"]);
        git(&work, &["init", "-q"]);
        fs::write(work.join("main.tf"), "# empty\n").expect("write");

        let repo = Git::new(&work);
        repo.checkout_new_branch("fix/one").expect("branch");
        repo.add_all().expect("add");
        let author = CommitAuthor {
            name: "tester".to_string(),
            email: "tester@localhost".to_string(),
        };
        assert!(repo.commit_staged("initial\n", &author).expect("commit"));
        git(&work, &["remote", "add", "origin", &remote.display().to_string()]);

        repo.push("origin", "fix/one").expect("push");
        git(&remote, &["rev-parse", "--verify", "refs/heads/fix/one"]);

        let err = repo.push("missing", "fix/one").expect_err("unknown remote");
        assert!(err.to_string().contains("git push -u missing fix/one failed"));
    }

    #[test]
    fn directory_without_git_is_not_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repository());
    }
}
