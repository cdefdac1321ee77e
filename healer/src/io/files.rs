//! Discovery of the declarative files handed to remediation capabilities.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

const TERRAFORM_EXTENSION: &str = "tf";
const PROVIDER_CACHE_DIR: &str = ".terraform";
const GIT_DIR: &str = ".git";

/// Every `*.tf` file under `root`, relative to it and sorted.
///
/// Skips the provider cache, `.git` and the artifacts directory.
pub fn declarative_files(root: &Path, artifacts_dir: &str) -> Vec<PathBuf> {
    let artifacts = root.join(artifacts_dir);
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e, &artifacts))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(err = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension() == Some(OsStr::new(TERRAFORM_EXTENSION)))
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf()
        })
        .collect();
    files.sort();
    files
}

fn is_ignored_dir(entry: &DirEntry, artifacts: &Path) -> bool {
    if !entry.file_type().is_dir() || entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name();
    name == PROVIDER_CACHE_DIR || name == GIT_DIR || entry.path() == artifacts
}
