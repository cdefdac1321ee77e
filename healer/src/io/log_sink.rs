//! Append-only, line-oriented log sink for verification summaries.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub trait LogSink {
    /// Append one line. Callers treat errors as non-fatal.
    fn append_line(&self, line: &str) -> Result<()>;
}

/// Appends lines to a file, creating it (and its parent) on first write.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    path: PathBuf,
}

impl FileLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn append_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{}", line.trim_end()).with_context(|| format!("append {}", self.path.display()))
    }
}

/// Discards every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn append_line(&self, _line: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = FileLogSink::new(temp.path().join("run/build.log"));
        sink.append_line("first").expect("append");
        sink.append_line("second\n").expect("append");
        let contents = fs::read_to_string(sink.path()).expect("read");
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn unwritable_path_reports_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").expect("write");
        let sink = FileLogSink::new(blocker.join("build.log"));
        assert!(sink.append_line("line").is_err());
    }
}
