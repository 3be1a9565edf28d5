//! Test doubles shared by the integration tests.
//!
//! [`ScriptedRuntime`] stands in for the container runtime CLI. It keeps a
//! small model of containers (created by `run -d`, removed by `rm -f`,
//! described by `inspect`) and answers everything else from scripted rules,
//! defaulting to a silent success.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use agent_sandbox::{
    CommandOutput, ContainerProvider, ContainerRuntime, Error, OutputSink, Result, Settings,
    TaskLogger,
};

/// Offset added to container ports to fake runtime-assigned host ports.
pub const HOST_PORT_OFFSET: u16 = 40000;

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    Error(String),
}

struct Rule {
    pattern: String,
    reply: Option<Reply>,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    labels: BTreeMap<String, String>,
    ports: Vec<u16>,
}

/// Scripted container runtime.
#[derive(Default)]
pub struct ScriptedRuntime {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    image_missing: Mutex<bool>,
    builds: AtomicUsize,
    build_delay: Mutex<Duration>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands whose argv contains `pattern` exit with `code` and `stderr`.
    pub fn fail(&self, pattern: &str, code: i32, stderr: &str) {
        self.push(pattern, Some(Reply::Output(CommandOutput::new(code, "", stderr))), None);
    }

    /// Commands whose argv contains `pattern` print `stdout` and succeed.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.push(pattern, Some(Reply::Output(CommandOutput::new(0, stdout, ""))), None);
    }

    /// Commands whose argv contains `pattern` fail to launch.
    pub fn error(&self, pattern: &str, message: &str) {
        self.push(pattern, Some(Reply::Error(message.to_string())), None);
    }

    /// Cancels `token` when a command containing `pattern` runs. The
    /// command itself still completes normally.
    pub fn cancel_on(&self, pattern: &str, token: CancellationToken) {
        self.push(pattern, None, Some(token));
    }

    /// Makes `image inspect` fail until a build succeeds.
    pub fn missing_image(&self, build_delay: Duration) {
        *self.image_missing.lock().unwrap() = true;
        *self.build_delay.lock().unwrap() = build_delay;
    }

    fn push(&self, pattern: &str, reply: Option<Reply>, cancel: Option<CancellationToken>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            reply,
            cancel,
        });
    }

    /// Number of `image build` invocations.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Every argv received, joined with spaces.
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|args| args.join(" "))
            .collect()
    }

    /// Raw argv of every call.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose joined argv contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Number of calls whose joined argv starts with `prefix`.
    pub fn count_starting(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Index of the first call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    pub fn container_exists(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }

    /// Overwrites a label on a running fake container.
    pub fn set_label(&self, name: &str, key: &str, value: &str) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(name) {
            container.labels.insert(key.to_string(), value.to_string());
        }
    }

    fn scripted(&self, line: &str) -> Option<Reply> {
        let rules = self.rules.lock().unwrap();
        for rule in rules.iter().filter(|r| line.contains(&r.pattern)) {
            if let Some(token) = &rule.cancel {
                token.cancel();
            }
        }
        rules
            .iter()
            .filter(|r| line.contains(&r.pattern))
            .find_map(|r| r.reply.clone())
    }

    async fn answer(&self, args: Vec<String>) -> Result<CommandOutput> {
        let line = args.join(" ");
        self.calls.lock().unwrap().push(args.clone());

        if let Some(reply) = self.scripted(&line) {
            return match reply {
                Reply::Output(output) => Ok(output),
                Reply::Error(message) => Err(Error::Runtime(message)),
            };
        }

        let first = args.first().map(String::as_str).unwrap_or_default();
        let second = args.get(1).map(String::as_str).unwrap_or_default();
        match (first, second) {
            ("image", "inspect") => {
                if *self.image_missing.lock().unwrap() {
                    Ok(CommandOutput::new(1, "", "Error: No such image"))
                } else {
                    Ok(CommandOutput::new(0, "[]", ""))
                }
            }
            ("image", "build") => {
                self.builds.fetch_add(1, Ordering::SeqCst);
                let delay = *self.build_delay.lock().unwrap();
                tokio::time::sleep(delay).await;
                *self.image_missing.lock().unwrap() = false;
                Ok(CommandOutput::default())
            }
            ("run", _) => Ok(self.start_container(&args)),
            ("inspect", name) => Ok(self.inspect(name)),
            ("rm", _) => {
                let target = args.last().cloned().unwrap_or_default();
                let name = target.trim_start_matches("cid-").to_string();
                match self.containers.lock().unwrap().remove(&name) {
                    Some(_) => Ok(CommandOutput::new(0, name, "")),
                    None => Ok(CommandOutput::new(
                        1,
                        "",
                        format!("Error response from daemon: No such container: {}", name),
                    )),
                }
            }
            _ => Ok(CommandOutput::default()),
        }
    }

    fn start_container(&self, args: &[String]) -> CommandOutput {
        let mut name = String::new();
        let mut labels = BTreeMap::new();
        let mut ports = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--name" => name = iter.next().cloned().unwrap_or_default(),
                "--label" => {
                    if let Some((k, v)) = iter.next().and_then(|l| l.split_once('=')) {
                        labels.insert(k.to_string(), v.to_string());
                    }
                }
                "-p" => {
                    if let Some(port) = iter
                        .next()
                        .and_then(|p| p.rsplit(':').next())
                        .and_then(|p| p.parse::<u16>().ok())
                    {
                        ports.push(port);
                    }
                }
                _ => {}
            }
        }

        self.containers
            .lock()
            .unwrap()
            .insert(name.clone(), FakeContainer { labels, ports });
        CommandOutput::new(0, format!("cid-{}\n", name), "")
    }

    fn inspect(&self, name: &str) -> CommandOutput {
        let containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(name) else {
            return CommandOutput::new(1, "[]", format!("Error: No such object: {}", name));
        };

        let ports: serde_json::Map<String, serde_json::Value> = container
            .ports
            .iter()
            .map(|port| {
                (
                    format!("{}/tcp", port),
                    serde_json::json!([{
                        "HostIp": "127.0.0.1",
                        "HostPort": (port + HOST_PORT_OFFSET).to_string()
                    }]),
                )
            })
            .collect();

        let json = serde_json::json!([{
            "Id": format!("cid-{}", name),
            "State": {"Running": true},
            "Config": {"Labels": container.labels},
            "NetworkSettings": {"Ports": ports}
        }]);
        CommandOutput::new(0, json.to_string(), "")
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn invoke(&self, args: Vec<String>, _sink: Option<OutputSink>) -> Result<CommandOutput> {
        self.answer(args).await
    }

    async fn invoke_detached(
        &self,
        args: Vec<String>,
        _sink: Option<OutputSink>,
        _grace: Duration,
    ) -> Result<CommandOutput> {
        let output = self.answer(args).await?;
        if output.success() {
            Ok(CommandOutput::detached())
        } else {
            Err(Error::DetachedExit {
                code: output.exit_code(),
                stderr: output.stderr().to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Settings with no dev server settle delay.
pub fn test_settings() -> Settings {
    Settings {
        dev_server_settle_ms: 0,
        ..Settings::default()
    }
}

pub fn provider(runtime: &Arc<ScriptedRuntime>) -> ContainerProvider {
    ContainerProvider::new(runtime.clone(), &test_settings())
}

/// Logger that keeps every message as `"<level>: <text>"`.
#[derive(Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    fn push(&self, level: &str, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("{}: {}", level, message));
    }
}

#[async_trait]
impl TaskLogger for MemoryLogger {
    async fn info(&self, message: &str) {
        self.push("info", message);
    }

    async fn warn(&self, message: &str) {
        self.push("warn", message);
    }

    async fn error(&self, message: &str) {
        self.push("error", message);
    }

    async fn success(&self, message: &str) {
        self.push("success", message);
    }

    async fn command(&self, command: &str) {
        self.push("command", command);
    }
}
