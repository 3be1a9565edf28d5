//! Container runtime CLI invocation.
//!
//! Every interaction with the container runtime (`docker` by default) goes
//! through [`ContainerRuntime`], which spawns the CLI as a subprocess. The
//! trait is the seam where tests substitute scripted results.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::process::{CommandOutput, OutputLine, OutputSink};

/// Abstraction over the container runtime's command-line interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runs the runtime CLI with `args` and waits for it to exit.
    ///
    /// A nonzero exit is reported through [`CommandOutput::exit_code`], not
    /// as an error. Only launch-level failures return `Err`.
    async fn invoke(&self, args: Vec<String>, sink: Option<OutputSink>) -> Result<CommandOutput>;

    /// Starts the runtime CLI with `args` without waiting for it to finish.
    ///
    /// Resolves with an optimistic success once `grace` elapses with the
    /// process still alive. Fails if the process cannot be spawned or exits
    /// nonzero inside the grace window.
    async fn invoke_detached(
        &self,
        args: Vec<String>,
        sink: Option<OutputSink>,
        grace: Duration,
    ) -> Result<CommandOutput>;

    /// Returns the name of this runtime.
    fn name(&self) -> &str;
}

/// Runtime backed by a CLI binary on the host (`docker`, `podman`, ...).
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl CliRuntime {
    /// Creates a runtime that shells out to `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn invoke(&self, args: Vec<String>, sink: Option<OutputSink>) -> Result<CommandOutput> {
        tracing::debug!(runtime = %self.binary, subcommand = ?args.first(), "invoking runtime");
        run_foreground(self.command(&args), sink).await
    }

    async fn invoke_detached(
        &self,
        args: Vec<String>,
        sink: Option<OutputSink>,
        grace: Duration,
    ) -> Result<CommandOutput> {
        tracing::debug!(
            runtime = %self.binary,
            subcommand = ?args.first(),
            "invoking runtime detached"
        );
        run_detached(self.command(&args), sink, grace).await
    }

    fn name(&self) -> &str {
        &self.binary
    }
}

/// Spawns `cmd`, streams its output to `sink` and waits for exit.
pub async fn run_foreground(mut cmd: Command, sink: Option<OutputSink>) -> Result<CommandOutput> {
    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Runtime("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Runtime("stderr was not captured".to_string()))?;

    let (out, err) = tokio::join!(
        capture(stdout, OutputLine::Stdout, sink.clone()),
        capture(stderr, OutputLine::Stderr, sink),
    );

    let status = child.wait().await?;
    Ok(CommandOutput::new(status.code().unwrap_or(-1), out, err))
}

/// Spawns `cmd` and returns once it has survived `grace`.
///
/// The child keeps running after this returns; a background task keeps
/// draining its output into `sink` until it exits.
pub async fn run_detached(
    mut cmd: Command,
    sink: Option<OutputSink>,
    grace: Duration,
) -> Result<CommandOutput> {
    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Runtime("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Runtime("stderr was not captured".to_string()))?;

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (_, err) = tokio::join!(
            capture(stdout, OutputLine::Stdout, sink.clone()),
            capture(stderr, OutputLine::Stderr, sink),
        );
        let status = child.wait().await;
        let _ = exit_tx.send((status, err));
    });

    match tokio::time::timeout(grace, exit_rx).await {
        // Still running after the grace window.
        Err(_) => Ok(CommandOutput::detached()),
        Ok(Ok((Ok(status), stderr))) if status.success() => {
            Ok(CommandOutput::new(0, String::new(), stderr))
        }
        Ok(Ok((Ok(status), stderr))) => Err(Error::DetachedExit {
            code: status.code().unwrap_or(-1),
            stderr,
        }),
        Ok(Ok((Err(e), _))) => Err(Error::Io(e)),
        Ok(Err(_)) => Err(Error::Runtime(
            "detached process monitor exited unexpectedly".to_string(),
        )),
    }
}

/// Reads `reader` line by line, forwarding each line to `sink`.
async fn capture<R>(reader: R, wrap: fn(String) -> OutputLine, sink: Option<OutputSink>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    let mut sink = sink;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                captured.push_str(&line);
                captured.push('\n');
                if let Some(tx) = &sink {
                    if tx.send(wrap(line)).await.is_err() {
                        tracing::debug!("output receiver dropped");
                        sink = None;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "error reading process output");
                break;
            }
        }
    }

    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn foreground_captures_both_streams_and_exit_code() {
        let runtime = CliRuntime::new("sh");
        let output = runtime
            .invoke(sh("echo out; echo err >&2; exit 4"), None)
            .await
            .expect("spawn failed");

        assert_eq!(output.exit_code(), 4);
        assert!(!output.success());
        assert_eq!(output.stdout(), "out\n");
        assert_eq!(output.stderr(), "err\n");
    }

    #[tokio::test]
    async fn foreground_forwards_lines_to_sink() {
        let runtime = CliRuntime::new("sh");
        let (tx, mut rx) = mpsc::channel(16);

        let output = runtime
            .invoke(sh("echo one; echo two"), Some(tx))
            .await
            .expect("spawn failed");
        assert!(output.success());

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(
            lines,
            vec![
                OutputLine::Stdout("one".to_string()),
                OutputLine::Stdout("two".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn foreground_missing_binary_is_an_error() {
        let runtime = CliRuntime::new("definitely-not-a-real-binary-xyz");
        let result = runtime.invoke(vec![], None).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn detached_early_failure_rejects() {
        let runtime = CliRuntime::new("sh");
        let result = runtime
            .invoke_detached(
                sh("echo port in use >&2; exit 3"),
                None,
                Duration::from_millis(500),
            )
            .await;

        match result {
            Err(Error::DetachedExit { code, stderr }) => {
                assert_eq!(code, 3);
                assert!(stderr.contains("port in use"));
            }
            other => panic!("expected early exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn detached_long_running_resolves_after_grace() {
        let runtime = CliRuntime::new("sh");
        let start = Instant::now();
        let output = runtime
            .invoke_detached(sh("sleep 3"), None, Duration::from_millis(300))
            .await
            .expect("detached start should succeed");

        assert!(output.success());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn detached_missing_binary_rejects() {
        let runtime = CliRuntime::new("definitely-not-a-real-binary-xyz");
        let result = runtime
            .invoke_detached(vec![], None, Duration::from_millis(100))
            .await;
        assert!(result.is_err());
    }
}
