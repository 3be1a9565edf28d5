//! Container-backed sandboxes.
//!
//! A [`ContainerSandbox`] owns one container and two named volumes
//! (`<id>-workspace` mounted at [`PROJECT_DIR`], `<id>-cache` mounted at
//! [`CACHE_DIR`]). Its lifecycle is `uninitialized -> running -> stopped`;
//! a stopped sandbox is never restarted.
//!
//! [`ContainerProvider`] creates sandboxes and keeps the set of live handles
//! for this process, one per sandbox id. Handles it has never seen are
//! rebuilt from the runtime's `inspect` output.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::process::{shell_quote, CommandOutput, ProcessRunner, RunCommandRequest};
use crate::runtime::ContainerRuntime;
use crate::secrets::Secret;
use crate::settings::{Settings, DEFAULT_PORTS};

use super::image::ImageBuilder;
use super::metadata::{SandboxMetadata, CONFIG_LABEL, MANAGED_LABEL};

/// Where the workspace volume (the project tree) is mounted.
pub const PROJECT_DIR: &str = "/workspace";

/// Where the cache volume is mounted.
pub const CACHE_DIR: &str = "/cache";

/// Coarse sandbox status. The runtime is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Uninitialized,
    Running,
    Stopped,
}

/// Repository to clone into the project directory at creation.
#[derive(Debug, Clone)]
pub struct GitSource {
    /// Clone URL, possibly carrying credentials.
    pub url: Secret,
    /// Branch to clone instead of the default.
    pub branch: Option<String>,
    /// Shallow clone depth.
    pub depth: Option<u32>,
}

/// Configuration for [`ContainerProvider::create`].
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    /// Container ports to publish. Empty means the provider defaults.
    pub ports: Vec<u16>,
    /// Stop the sandbox this long after creation.
    pub timeout: Option<Duration>,
    /// CPU count; memory is sized at 2 GiB per CPU.
    pub vcpus: Option<u32>,
    /// Environment for every process in the container.
    pub env: BTreeMap<String, Secret>,
    /// Repository cloned right after the container starts.
    pub source: Option<GitSource>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = Some(vcpus);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    pub fn with_source(mut self, source: GitSource) -> Self {
        self.source = Some(source);
        self
    }
}

type LiveSandboxes = Mutex<HashMap<String, Arc<ContainerSandbox>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SandboxState {
    status: SandboxStatus,
    container_id: Option<String>,
    /// Container port -> host port assigned by the runtime.
    host_ports: BTreeMap<u16, u16>,
    idle_timer: Option<JoinHandle<()>>,
    released: bool,
}

/// Public URL settings shared by all sandboxes of a provider.
#[derive(Debug, Clone)]
struct Endpoint {
    scheme: String,
    host: String,
}

/// Handle to one live sandbox.
pub struct ContainerSandbox {
    id: String,
    metadata: SandboxMetadata,
    runner: ProcessRunner,
    endpoint: Endpoint,
    live: Weak<LiveSandboxes>,
    state: Mutex<SandboxState>,
}

impl std::fmt::Debug for ContainerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSandbox")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .field("status", &self.status())
            .finish()
    }
}

impl ContainerSandbox {
    /// Returns the sandbox id (also the container name).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SandboxStatus {
        lock(&self.state).status
    }

    /// Returns the backing container id, once started.
    pub fn container_id(&self) -> Option<String> {
        lock(&self.state).container_id.clone()
    }

    pub fn ports(&self) -> &[u16] {
        &self.metadata.ports
    }

    pub fn workspace_volume(&self) -> &str {
        &self.metadata.workspace_volume
    }

    pub fn cache_volume(&self) -> &str {
        &self.metadata.cache_volume
    }

    pub fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    /// Returns the base URL of a dev server listening on `port`.
    ///
    /// Defaults to the first configured port. Uses the host port the runtime
    /// published it on when known. No network access.
    pub fn domain(&self, port: Option<u16>) -> String {
        let port = port
            .or_else(|| self.metadata.ports.first().copied())
            .unwrap_or(DEFAULT_PORTS[0]);
        let host_port = lock(&self.state)
            .host_ports
            .get(&port)
            .copied()
            .unwrap_or(port);
        format!(
            "{}://{}:{}",
            self.endpoint.scheme, self.endpoint.host, host_port
        )
    }

    /// Runs a command inside the container.
    pub async fn run_command(&self, request: RunCommandRequest) -> Result<CommandOutput> {
        let container_id = {
            let state = lock(&self.state);
            match (&state.container_id, state.status) {
                (None, _) => return Err(Error::NotInitialized(self.id.clone())),
                (Some(_), SandboxStatus::Stopped) => return Err(Error::Stopped(self.id.clone())),
                (Some(id), _) => id.clone(),
            }
        };

        self.runner.run(&container_id, request).await
    }

    /// Writes `content` to `path` inside the container.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let script = format!(
            "mkdir -p \"$(dirname {path})\" && printf %s {data} | base64 -d > {path}",
            path = shell_quote(path),
            data = shell_quote(&STANDARD.encode(content)),
        );

        let output = self
            .run_command(RunCommandRequest::new("sh").args(["-c", script.as_str()]))
            .await?;

        if !output.success() {
            return Err(Error::Runtime(format!(
                "failed to write {}: {}",
                path,
                output.stderr().trim()
            )));
        }
        Ok(())
    }

    /// Returns true if `path` is a regular file inside the container.
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self
            .run_command(RunCommandRequest::new("test").args(["-f", path]))
            .await?;
        Ok(output.success())
    }

    /// Stops the sandbox, removing its container and volumes.
    ///
    /// Idempotent. Volume removal is best effort.
    pub async fn stop(&self) -> Result<()> {
        let (container_id, timer) = {
            let mut state = lock(&self.state);
            if state.released {
                return Ok(());
            }
            state.released = true;
            (state.container_id.clone(), state.idle_timer.take())
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        let runtime = self.runner.runtime();
        let target = container_id.unwrap_or_else(|| self.id.clone());
        let output = runtime
            .invoke(vec!["rm".into(), "-f".into(), target.clone()], None)
            .await;

        match output {
            Ok(out) if out.success() => {}
            Ok(out) if out.stderr().to_lowercase().contains("no such container") => {}
            other => {
                lock(&self.state).released = false;
                let reason = match other {
                    Ok(out) => out.stderr().trim().to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(Error::Runtime(format!(
                    "failed to remove container {}: {}",
                    target, reason
                )));
            }
        }

        for volume in [&self.metadata.workspace_volume, &self.metadata.cache_volume] {
            let removed = runtime
                .invoke(
                    vec!["volume".into(), "rm".into(), "-f".into(), volume.clone()],
                    None,
                )
                .await;
            match removed {
                Ok(out) if out.success() => {}
                Ok(out) => tracing::warn!(
                    volume = %volume,
                    stderr = %out.stderr().trim(),
                    "failed to remove sandbox volume"
                ),
                Err(e) => tracing::warn!(volume = %volume, error = %e, "failed to remove sandbox volume"),
            }
        }

        lock(&self.state).status = SandboxStatus::Stopped;

        if let Some(live) = self.live.upgrade() {
            lock(&live).remove(&self.id);
        }

        tracing::info!(sandbox_id = %self.id, "sandbox stopped");
        Ok(())
    }

    fn arm_idle_timeout(self: &Arc<Self>, after: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(sandbox) = weak.upgrade() {
                // Detach our own handle so stop() doesn't abort this task.
                lock(&sandbox.state).idle_timer.take();
                tracing::info!(sandbox_id = %sandbox.id, "sandbox timeout reached, stopping");
                if let Err(e) = sandbox.stop().await {
                    tracing::error!(sandbox_id = %sandbox.id, error = %e, "failed to stop expired sandbox");
                }
            }
        });
        lock(&self.state).idle_timer = Some(handle);
    }

    fn mark_running(&self, container_id: String, host_ports: BTreeMap<u16, u16>) {
        let mut state = lock(&self.state);
        state.container_id = Some(container_id);
        state.host_ports = host_ports;
        state.status = SandboxStatus::Running;
    }
}

struct ProviderInner {
    runner: ProcessRunner,
    images: ImageBuilder,
    endpoint: Endpoint,
    default_ports: Vec<u16>,
    live: Arc<LiveSandboxes>,
}

/// Creates sandboxes and tracks the live ones for this process.
#[derive(Clone)]
pub struct ContainerProvider {
    inner: Arc<ProviderInner>,
}

impl ContainerProvider {
    /// Creates a provider driving `runtime` with `settings`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: &Settings) -> Self {
        let images = ImageBuilder::new(runtime.clone(), settings.image.clone());
        Self::with_image_builder(runtime, settings, images)
    }

    /// Creates a provider with a preconfigured [`ImageBuilder`].
    pub fn with_image_builder(
        runtime: Arc<dyn ContainerRuntime>,
        settings: &Settings,
        images: ImageBuilder,
    ) -> Self {
        let default_ports = if settings.default_ports.is_empty() {
            DEFAULT_PORTS.to_vec()
        } else {
            settings.default_ports.clone()
        };

        Self {
            inner: Arc::new(ProviderInner {
                runner: ProcessRunner::new(runtime).with_detached_grace(settings.detached_grace()),
                images,
                endpoint: Endpoint {
                    scheme: settings.public_scheme.clone(),
                    host: settings.public_host.clone(),
                },
                default_ports,
                live: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.inner.runner.runtime()
    }

    /// Returns the live handle for `sandbox_id` without touching the runtime.
    pub fn tracked(&self, sandbox_id: &str) -> Option<Arc<ContainerSandbox>> {
        lock(&self.inner.live).get(sandbox_id).cloned()
    }

    /// Number of live handles in this process.
    pub fn live_count(&self) -> usize {
        lock(&self.inner.live).len()
    }

    fn new_handle(&self, id: String, metadata: SandboxMetadata) -> ContainerSandbox {
        ContainerSandbox {
            id,
            metadata,
            runner: self.inner.runner.clone(),
            endpoint: self.inner.endpoint.clone(),
            live: Arc::downgrade(&self.inner.live),
            state: Mutex::new(SandboxState {
                status: SandboxStatus::Uninitialized,
                container_id: None,
                host_ports: BTreeMap::new(),
                idle_timer: None,
                released: false,
            }),
        }
    }

    /// Creates a fresh sandbox with a newly minted id.
    pub async fn create(&self, config: SandboxConfig) -> Result<Arc<ContainerSandbox>> {
        self.inner.images.ensure().await?;

        let id = format!("sbx-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let ports = if config.ports.is_empty() {
            self.inner.default_ports.clone()
        } else {
            config.ports.clone()
        };

        let mut metadata = SandboxMetadata::new(&id, ports);
        if let Some(timeout) = config.timeout {
            metadata = metadata.with_expiry(now_ms().saturating_add(timeout.as_millis() as u64));
        }

        let sandbox = Arc::new(self.new_handle(id.clone(), metadata));

        for volume in [sandbox.workspace_volume(), sandbox.cache_volume()] {
            let output = self
                .runtime()
                .invoke(vec!["volume".into(), "create".into(), volume.to_string()], None)
                .await?;
            if !output.success() {
                return Err(creation_error(format!(
                    "volume create {} failed: {}",
                    volume,
                    output.stderr().trim()
                )));
            }
        }

        let args = self.run_args(&sandbox, &config)?;
        let output = self.runtime().invoke(args, None).await?;
        if !output.success() {
            return Err(creation_error(format!(
                "container start failed: {}",
                output.stderr().trim()
            )));
        }

        let container_id = output.stdout().trim().to_string();
        let host_ports = match self.inspect(&id).await {
            Ok(Some(info)) => info.host_ports,
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "could not read published ports");
                BTreeMap::new()
            }
        };
        let container_id = if container_id.is_empty() { id.clone() } else { container_id };
        sandbox.mark_running(container_id, host_ports);

        tracing::info!(
            sandbox_id = %id,
            ports = ?sandbox.ports(),
            "created sandbox container"
        );

        if let Some(source) = &config.source {
            if let Err(e) = clone_source(&sandbox, source).await {
                if let Err(stop_err) = sandbox.stop().await {
                    tracing::warn!(sandbox_id = %id, error = %stop_err, "cleanup after failed clone");
                }
                return Err(e);
            }
        }

        if let Some(timeout) = config.timeout {
            sandbox.arm_idle_timeout(timeout);
        }

        lock(&self.inner.live).insert(id, sandbox.clone());
        Ok(sandbox)
    }

    fn run_args(&self, sandbox: &ContainerSandbox, config: &SandboxConfig) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            sandbox.id().to_string(),
            "--label".into(),
            format!("{}=true", MANAGED_LABEL),
            "--label".into(),
            format!("{}={}", CONFIG_LABEL, sandbox.metadata().encode()?),
            "-v".into(),
            format!("{}:{}", sandbox.workspace_volume(), PROJECT_DIR),
            "-v".into(),
            format!("{}:{}", sandbox.cache_volume(), CACHE_DIR),
        ];

        for port in sandbox.ports() {
            args.extend(["-p".into(), format!("127.0.0.1::{}", port)]);
        }

        for (key, value) in &config.env {
            args.extend(["-e".into(), format!("{}={}", key, value.expose())]);
        }

        if let Some(vcpus) = config.vcpus {
            args.extend([
                "--cpus".into(),
                vcpus.to_string(),
                "--memory".into(),
                format!("{}g", u64::from(vcpus) * 2),
            ]);
        }

        // With a timeout, PID 1 exits at the deadline and `--rm` removes the
        // container even if no process is left to run the idle timer.
        let lifetime = match config.timeout {
            Some(timeout) => {
                args.insert(2, "--rm".into());
                lifetime_secs(timeout).to_string()
            }
            None => "infinity".to_string(),
        };

        args.push(self.inner.images.image().to_string());
        args.extend(["sleep".into(), lifetime]);
        Ok(args)
    }

    /// Returns the sandbox with `sandbox_id`, rebuilding it from the runtime
    /// if this process doesn't track it yet.
    pub async fn get(&self, sandbox_id: &str) -> Result<Arc<ContainerSandbox>> {
        if let Some(sandbox) = self.tracked(sandbox_id) {
            return Ok(sandbox);
        }

        let info = self
            .inspect(sandbox_id)
            .await?
            .ok_or_else(|| Error::NotFound(sandbox_id.to_string()))?;

        let metadata = SandboxMetadata::decode_or_default(
            info.labels.get(CONFIG_LABEL).map(String::as_str),
            sandbox_id,
            &self.inner.default_ports,
        );
        let expires_at = metadata.expires_at_ms;

        let sandbox = Arc::new(self.new_handle(sandbox_id.to_string(), metadata));
        sandbox.mark_running(info.id, info.host_ports);
        if !info.running {
            lock(&sandbox.state).status = SandboxStatus::Stopped;
        }

        let sandbox = {
            let mut live = lock(&self.inner.live);
            if let Some(existing) = live.get(sandbox_id) {
                return Ok(existing.clone());
            }
            live.insert(sandbox_id.to_string(), sandbox.clone());
            sandbox
        };

        if let (Some(expires_at), SandboxStatus::Running) = (expires_at, sandbox.status()) {
            sandbox.arm_idle_timeout(Duration::from_millis(expires_at.saturating_sub(now_ms())));
        }

        tracing::info!(sandbox_id = %sandbox_id, "reconnected to existing sandbox");
        Ok(sandbox)
    }

    async fn inspect(&self, name: &str) -> Result<Option<InspectedContainer>> {
        let output = self
            .runtime()
            .invoke(vec!["inspect".into(), name.to_string()], None)
            .await?;

        if !output.success() {
            return Ok(None);
        }

        parse_inspect(output.stdout())
    }
}

fn creation_error(message: String) -> Error {
    if message.to_lowercase().contains("timeout") || message.to_lowercase().contains("timed out") {
        Error::SandboxTimeout(message)
    } else {
        Error::SandboxCreation(message)
    }
}

/// Whole seconds for `sleep`, rounded up and never zero.
fn lifetime_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn clone_source(sandbox: &ContainerSandbox, source: &GitSource) -> Result<()> {
    let mut request = RunCommandRequest::new("git").arg("clone");
    if let Some(depth) = source.depth {
        request = request.args(["--depth".to_string(), depth.to_string()]);
    }
    if let Some(branch) = &source.branch {
        request = request.args(["--branch", branch.as_str()]);
    }
    request = request.args([source.url.expose(), "."]).cwd(PROJECT_DIR);

    let output = sandbox.run_command(request).await?;
    if !output.success() {
        return Err(Error::Clone(output.stderr().trim().to_string()));
    }
    Ok(())
}

/// The parts of `inspect` output a handle is rebuilt from.
#[derive(Debug, Clone, Default)]
pub struct InspectedContainer {
    pub id: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub host_ports: BTreeMap<u16, u16>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    network_settings: InspectNetwork,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_port: String,
}

/// Parses `inspect` JSON (an array with one entry per object).
pub fn parse_inspect(json: &str) -> Result<Option<InspectedContainer>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let mut host_ports = BTreeMap::new();
    for (key, bindings) in entry.network_settings.ports.unwrap_or_default() {
        let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        let host_port = bindings
            .unwrap_or_default()
            .iter()
            .find_map(|b| b.host_port.parse::<u16>().ok());
        if let Some(host_port) = host_port {
            host_ports.insert(container_port, host_port);
        }
    }

    Ok(Some(InspectedContainer {
        id: entry.id,
        running: entry.state.running,
        labels: entry.config.labels.unwrap_or_default(),
        host_ports,
    }))
}
