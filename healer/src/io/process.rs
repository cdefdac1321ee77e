//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every external tool call goes through a [`CommandRunner`] so tests can script
//! tool behavior without spawning terraform or opa.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::ToolFailure;

/// A fully described child process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandRequest {
    pub fn new(
        program: impl Into<String>,
        workdir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.to_path_buf(),
            stdin: None,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    /// First argument, or the program itself when there are none.
    pub fn subcommand(&self) -> &str {
        self.args.first().map_or(self.program.as_str(), String::as_str)
    }

    /// Short label such as `terraform plan`, used in logs and failure records.
    pub fn label(&self) -> String {
        match self.args.first() {
            Some(first) => format!("{} {first}", program_name(&self.program)),
            None => program_name(&self.program).to_string(),
        }
    }
}

fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

/// Captured child process output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal (including timeout kills).
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, for substring matching.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.stderr_text());
        text
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

/// Abstraction over child process execution.
///
/// `Err` means the process could not be run at all (spawn or pipe failure).
/// A timeout or a non-zero exit is reported through [`CommandOutput`].
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput>;
}

/// Runs requests as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).current_dir(&request.workdir);
        run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {}", request.label()))
    }
}

/// Run a request, turning spawn failures and timeouts into a [`ToolFailure`].
///
/// Non-zero exits are returned as output for the caller to interpret.
pub fn execute<R: CommandRunner + ?Sized>(
    runner: &R,
    request: &CommandRequest,
) -> std::result::Result<CommandOutput, ToolFailure> {
    let step = request.label();
    let output = runner
        .run(request)
        .map_err(|err| ToolFailure::spawn(&step, format!("{err:#}")))?;
    if output.timed_out {
        return Err(ToolFailure::timed_out(&step, output.stderr_text()));
    }
    Ok(output)
}

/// Like [`execute`], but a non-zero exit is also a failure.
pub fn execute_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    request: &CommandRequest,
) -> std::result::Result<CommandOutput, ToolFailure> {
    let output = execute(runner, request)?;
    if !output.success() {
        return Err(ToolFailure::exit_status(
            &request.label(),
            output.exit_code,
            output.stderr_text(),
        ));
    }
    Ok(output)
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            kill_and_reap(&mut child);
            return Err(anyhow!("stdout/stderr were not piped"));
        }
    };

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Input is written on its own thread so a child that never reads stdin
    // cannot hold us past the timeout.
    let stdin_handle = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => {
            let input = input.to_vec();
            Some(thread::spawn(move || write_stdin(pipe, &input)))
        }
        (Some(_), None) => {
            kill_and_reap(&mut child);
            return Err(anyhow!("stdin was not piped"));
        }
        (None, _) => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            if let Err(e) = child.kill() {
                warn!(err = %e, "failed to kill timed out command");
            }
            child.wait().context("wait command after kill")?
        }
        Err(e) => {
            kill_and_reap(&mut child);
            return Err(e).context("wait for command");
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "failed to write stdin"),
            Err(_) => warn!("stdin writer thread panicked"),
        }
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn write_stdin(mut pipe: ChildStdin, input: &[u8]) -> std::io::Result<()> {
    match pipe.write_all(input) {
        // The child may exit without reading its input.
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            warn!("child closed stdin before reading all input");
            Ok(())
        }
        other => other,
    }
}

/// Best effort: a child left behind on an error path must not outlive the call.
fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(err = %e, "failed to kill command");
    }
    if let Err(e) = child.wait() {
        warn!(err = %e, "failed to reap command");
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::core::types::FailureKind;
    use crate::test_support::{ScriptedCommandRunner, ScriptedResponse};

    fn sh(script: &str, timeout: Duration) -> CommandRequest {
        CommandRequest::new("sh", Path::new("."), timeout, 1024)
            .arg("-c")
            .arg(script)
    }

    #[test]
    fn label_uses_program_file_name() {
        let request = CommandRequest::new(
            "/usr/local/bin/terraform",
            Path::new("."),
            Duration::from_secs(1),
            10,
        )
        .args(["plan", "-input=false"]);
        assert_eq!(request.label(), "terraform plan");
        assert_eq!(request.subcommand(), "plan");
    }

    #[cfg(unix)]
    #[test]
    fn captures_exit_code_and_streams() {
        let output = SystemCommandRunner
            .run(&sh("echo out; echo err >&2; exit 3", Duration::from_secs(10)))
            .expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.stderr_text(), "err\n");
        assert_eq!(output.combined_text(), "out\nerr\n");
    }

    #[cfg(unix)]
    #[test]
    fn passes_stdin_to_child() {
        let request = sh("cat", Duration::from_secs(10)).stdin(b"hello".to_vec());
        let output = SystemCommandRunner.run(&request).expect("run");
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_reported_separately_from_exit_status() {
        let output = SystemCommandRunner
            .run(&sh("sleep 5", Duration::from_millis(100)))
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());

        let failure = execute(&SystemCommandRunner, &sh("sleep 5", Duration::from_millis(100)))
            .expect_err("timed out");
        assert_eq!(failure.kind, FailureKind::TimedOut);
    }

    /// A child that never reads a large stdin still times out on schedule.
    #[cfg(unix)]
    #[test]
    fn unread_stdin_does_not_outlast_timeout() {
        let request = sh("exec sleep 6", Duration::from_secs(1)).stdin(vec![b'x'; 1 << 20]);
        let started = Instant::now();

        let output = SystemCommandRunner.run(&request).expect("run");

        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "took {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn output_beyond_limit_is_counted() {
        let mut request = sh("printf 'abcdefghij'", Duration::from_secs(10));
        request.output_limit_bytes = 4;
        let output = SystemCommandRunner.run(&request).expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.truncated_notice("sh").contains("stdout truncated 6 bytes"));
    }

    #[test]
    fn spawn_failure_becomes_tool_failure() {
        let request = CommandRequest::new(
            "healer-test-no-such-binary",
            Path::new("."),
            Duration::from_secs(1),
            10,
        );
        let failure = execute(&SystemCommandRunner, &request).expect_err("spawn fails");
        assert_eq!(failure.kind, FailureKind::Spawn);
        assert_eq!(failure.step, "healer-test-no-such-binary");
    }

    #[test]
    fn checked_execution_rejects_non_zero_exit() {
        let runner = ScriptedCommandRunner::new()
            .on("plan", ScriptedResponse::exit(1, "", "Error: bad plan"));
        let request = CommandRequest::new("terraform", Path::new("."), Duration::from_secs(1), 10)
            .arg("plan");

        assert!(execute(&runner, &request).is_ok());
        let failure = execute_checked(&runner, &request).expect_err("non-zero exit");
        assert_eq!(failure.kind, FailureKind::ExitStatus { code: Some(1) });
        assert_eq!(failure.message, "terraform plan exited with status 1: Error: bad plan");
    }
}
