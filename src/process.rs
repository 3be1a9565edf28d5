//! Process runner for commands executed inside a sandbox container.
//!
//! Translates a [`RunCommandRequest`] into an `exec` invocation of the
//! container runtime. Two quoting regimes exist and must not be mixed:
//!
//! - without a working directory the command and its arguments are passed as
//!   an argv vector straight to the runtime, no shell involved;
//! - with a working directory they are composed into a single
//!   `cd <dir> && <cmd> <args...>` string run by `sh -c`, with every piece
//!   single-quote escaped by [`shell_quote`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::runtime::ContainerRuntime;

/// Grace window a detached command must survive to count as started.
pub const DEFAULT_DETACHED_GRACE: Duration = Duration::from_millis(500);

/// One line of output from a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// Standard output line.
    Stdout(String),
    /// Standard error line.
    Stderr(String),
}

/// Channel receiving command output as it is produced.
pub type OutputSink = mpsc::Sender<OutputLine>;

/// Result of a command execution.
///
/// Output is captured in full before the value is built, so the accessors
/// return the same text no matter how often they are called.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    /// Creates an output record from captured buffers.
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Optimistic result for a detached command that is still running.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Returns the process exit code.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns true if the exit code was zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns captured standard output.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Returns captured standard error.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

/// A single command to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct RunCommandRequest {
    /// Program to execute.
    pub command: String,
    /// Ordered arguments.
    pub args: Vec<String>,
    /// Working directory inside the container.
    pub cwd: Option<String>,
    /// Environment overlay.
    pub env: BTreeMap<String, String>,
    /// Start without waiting for exit.
    pub detached: bool,
    /// Receives output lines as they arrive.
    pub sink: Option<OutputSink>,
    /// Run as root.
    pub sudo: bool,
}

impl RunCommandRequest {
    /// Creates a request for `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            detached: false,
            sink: None,
            sudo: false,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Marks the command as detached.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Forwards output to `sink`.
    pub fn sink(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runs the command with elevated privileges.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Shell-quoted rendering of the command, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote_if_needed)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Wraps `value` in single quotes, escaping embedded quotes as `'\''`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn shell_quote_if_needed(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,%".contains(c));
    if plain {
        value.to_string()
    } else {
        shell_quote(value)
    }
}

/// Builds `cd <dir> && <cmd> <args...>` with every piece quoted.
pub fn compose_in_dir(dir: &str, command: &str, args: &[String]) -> String {
    let mut script = format!("cd {} && {}", shell_quote(dir), shell_quote(command));
    for arg in args {
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }
    script
}

/// Builds the runtime argv that executes `request` in `container_id`.
pub fn exec_args(container_id: &str, request: &RunCommandRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];

    if request.sudo {
        args.extend(["-u".to_string(), "root".to_string()]);
    }

    for (key, value) in &request.env {
        args.extend(["-e".to_string(), format!("{}={}", key, value)]);
    }

    args.push(container_id.to_string());

    match &request.cwd {
        Some(dir) => {
            args.extend(["sh".to_string(), "-c".to_string()]);
            args.push(compose_in_dir(dir, &request.command, &request.args));
        }
        None => {
            args.push(request.command.clone());
            args.extend(request.args.iter().cloned());
        }
    }

    args
}

/// Runs commands inside containers through a [`ContainerRuntime`].
///
/// No command is retried here; retry policy belongs to the caller.
#[derive(Clone)]
pub struct ProcessRunner {
    runtime: Arc<dyn ContainerRuntime>,
    detached_grace: Duration,
}

impl ProcessRunner {
    /// Creates a runner using the default detached grace window.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            detached_grace: DEFAULT_DETACHED_GRACE,
        }
    }

    /// Sets the detached grace window.
    pub fn with_detached_grace(mut self, grace: Duration) -> Self {
        self.detached_grace = grace;
        self
    }

    /// Returns the underlying runtime.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Executes `request` inside `container_id`.
    pub async fn run(&self, container_id: &str, request: RunCommandRequest) -> Result<CommandOutput> {
        let args = exec_args(container_id, &request);

        if request.detached {
            self.runtime
                .invoke_detached(args, request.sink, self.detached_grace)
                .await
        } else {
            self.runtime.invoke(args, request.sink).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    const AWKWARD: &[&str] = &[
        "it's complicated",
        "two words",
        "a && rm -rf /",
        "$HOME and $(whoami)",
        "'",
        "''",
        "",
        "back\\slash \"double\"",
        "feat/new-branch",
    ];

    fn run_sh(script: &str) -> String {
        let output = Command::new("sh")
            .args(["-c", script])
            .output()
            .expect("failed to run sh");
        assert!(output.status.success(), "script failed: {}", script);
        String::from_utf8(output.stdout).expect("non-utf8 output")
    }

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn shell_quote_round_trips_through_sh() {
        for value in AWKWARD {
            let script = format!("printf %s {}", shell_quote(value));
            assert_eq!(run_sh(&script), *value);
        }
    }

    #[test]
    fn composed_command_round_trips_through_sh() {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let spaced = dir.path().join("with space's");
        std::fs::create_dir(&spaced).expect("failed to create dir");

        for value in AWKWARD {
            let script = compose_in_dir(
                spaced.to_str().expect("utf8 path"),
                "printf",
                &["%s".to_string(), value.to_string()],
            );
            assert_eq!(run_sh(&script), *value);
        }
    }

    #[test]
    fn exec_args_without_cwd_uses_argv() {
        let request = RunCommandRequest::new("git")
            .args(["commit", "-m", "it's done && more"]);

        assert_eq!(
            exec_args("c1", &request),
            vec!["exec", "c1", "git", "commit", "-m", "it's done && more"]
        );
    }

    #[test]
    fn exec_args_with_cwd_uses_shell() {
        let request = RunCommandRequest::new("git")
            .args(["checkout", "-b", "agent/x y"])
            .cwd("/workspace");

        assert_eq!(
            exec_args("c1", &request),
            vec![
                "exec",
                "c1",
                "sh",
                "-c",
                "cd '/workspace' && 'git' 'checkout' '-b' 'agent/x y'"
            ]
        );
    }

    #[test]
    fn exec_args_include_user_and_env() {
        let request = RunCommandRequest::new("apt-get")
            .arg("update")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .sudo();

        assert_eq!(
            exec_args("c1", &request),
            vec![
                "exec",
                "-u",
                "root",
                "-e",
                "DEBIAN_FRONTEND=noninteractive",
                "c1",
                "apt-get",
                "update"
            ]
        );
    }

    #[test]
    fn command_line_quotes_only_when_needed() {
        let request = RunCommandRequest::new("git").args(["commit", "-m", "two words"]);
        assert_eq!(request.command_line(), "git commit -m 'two words'");
    }

    #[test]
    fn output_accessors_are_stable() {
        let output = CommandOutput::new(0, "hello\n", "");
        assert_eq!(output.stdout(), "hello\n");
        assert_eq!(output.stdout(), "hello\n");
        assert!(output.success());
        assert!(CommandOutput::detached().success());
    }
}
