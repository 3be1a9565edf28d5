//! Sandbox creation workflow.
//!
//! [`CreationWorkflow::run`] turns a [`ProvisionRequest`] into a running
//! sandbox with the working branch checked out. Stages run strictly in
//! order, one command at a time:
//!
//! 1. validate the request and resolve clone URL, timeout and ports
//! 2. create the sandbox and register it for the task
//! 3. clone the repository
//! 4. detect `package.json` / `requirements.txt`
//! 5. install dependencies (non-fatal)
//! 6. start the dev server (non-fatal)
//! 7. configure git
//! 8. check out the working branch
//!
//! Cancellation is cooperative: the token is checked after stage 1, after
//! stage 2, after stage 5 and before stage 7. A command already running is
//! never interrupted. A cancelled or failed run leaves its sandbox
//! registered so the caller can stop it.

mod deps;
mod dev_server;
mod git;
mod request;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Validate;
use crate::error::{Error, Result};
use crate::logger::{ProgressCallback, RedactingLogger, TaskLogger};
use crate::process::{CommandOutput, RunCommandRequest};
use crate::registry::SandboxRegistry;
use crate::sandbox::{ContainerSandbox, SandboxConfig, PROJECT_DIR};
use crate::secrets::{authenticated_clone_url, Secret};
use crate::settings::Settings;

pub use dev_server::{analyze_package_json, DevServerPlan, VITE_OVERRIDE_CONFIG, VITE_OVERRIDE_FILE};
pub use request::{
    generate_branch_name, parse_timeout, ProvisionOutcome, ProvisionReport, ProvisionRequest,
};

use request::WorkflowState;

/// Commands issued by one stage, logged before they run.
#[derive(Clone)]
pub(crate) struct Stage {
    sandbox: Arc<ContainerSandbox>,
    logger: Arc<dyn TaskLogger>,
}

impl Stage {
    fn new(sandbox: Arc<ContainerSandbox>, logger: Arc<dyn TaskLogger>) -> Self {
        Self { sandbox, logger }
    }

    /// Logs the command line, then runs it. A nonzero exit is not an error.
    async fn run(&self, request: RunCommandRequest) -> Result<CommandOutput> {
        self.logger.command(&request.command_line()).await;
        self.sandbox.run_command(request).await
    }

    /// Runs a command in the project directory.
    async fn run_in_project(&self, request: RunCommandRequest) -> Result<CommandOutput> {
        self.run(request.cwd(PROJECT_DIR)).await
    }
}

/// Short reason for a failed command: stderr if any, else the exit code.
fn failure_reason(output: &CommandOutput) -> String {
    let stderr = output.stderr().trim();
    if stderr.is_empty() {
        format!("exit code {}", output.exit_code())
    } else {
        stderr.to_string()
    }
}

/// True if the command ran and exited zero.
fn succeeded(result: &Result<CommandOutput>) -> bool {
    matches!(result, Ok(output) if output.success())
}

/// Provisions sandboxes for tasks.
pub struct CreationWorkflow {
    registry: Arc<SandboxRegistry>,
    settings: Arc<Settings>,
    logger: Arc<dyn TaskLogger>,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl CreationWorkflow {
    /// Creates a workflow that registers sandboxes in `registry`.
    pub fn new(
        registry: Arc<SandboxRegistry>,
        settings: Arc<Settings>,
        logger: Arc<dyn TaskLogger>,
    ) -> Self {
        Self {
            registry,
            settings,
            logger,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Uses `token` for cancellation instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this workflow at its next checkpoint.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the whole pipeline for `request`.
    ///
    /// Never returns a raw error: fatal failures become
    /// [`ProvisionOutcome::Failed`] with a redacted message.
    pub async fn run(&self, request: ProvisionRequest) -> ProvisionOutcome {
        let redactor = request.redactor();
        let logger: Arc<dyn TaskLogger> =
            Arc::new(RedactingLogger::new(self.logger.clone(), redactor.clone()));
        let mut state = WorkflowState::default();

        tracing::info!(task_id = %request.task_id, agent = %request.agent, "provisioning sandbox");

        match self.execute(&request, &logger, &mut state).await {
            Ok((sandbox, domain, branch_name)) => {
                self.report_progress(100, "Sandbox ready");
                logger
                    .success(&format!("Sandbox ready at {} on branch {}", domain, branch_name))
                    .await;
                ProvisionOutcome::Ready {
                    sandbox,
                    domain,
                    branch_name,
                }
            }
            Err(Error::Cancelled) => {
                tracing::info!(task_id = %request.task_id, "provisioning cancelled");
                logger.info("Provisioning cancelled").await;
                ProvisionOutcome::Cancelled
            }
            Err(e) => {
                let error = redactor.redact(&e.to_string());
                tracing::error!(task_id = %request.task_id, error = %error, "provisioning failed");
                logger.error(&error).await;
                ProvisionOutcome::Failed { error }
            }
        }
    }

    fn report_progress(&self, percent: u8, message: &str) {
        if let Some(progress) = &self.progress {
            progress(percent, message);
        }
    }

    fn checkpoint(&self, after: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::debug!(checkpoint = after, "cancellation observed");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: &ProvisionRequest,
        logger: &Arc<dyn TaskLogger>,
        state: &mut WorkflowState,
    ) -> Result<(Arc<ContainerSandbox>, String, String)> {
        self.report_progress(5, "Validating environment");
        for warning in request.validate().into_result()? {
            logger.warn(&warning).await;
        }
        state.clone_url = Some(authenticated_clone_url(
            &request.repo_url,
            request.github_token.as_ref().map(Secret::expose),
        ));
        state.timeout = parse_timeout(request.max_duration.as_deref(), self.settings.default_timeout());
        let ports = if request.ports.is_empty() {
            self.settings.default_ports.clone()
        } else {
            request.ports.clone()
        };
        self.checkpoint("validation")?;

        self.report_progress(15, "Creating sandbox");
        logger.info("Creating sandbox").await;
        let mut config = SandboxConfig::new()
            .with_ports(ports)
            .with_timeout(state.timeout);
        if let Some(vcpus) = request.vcpus {
            config = config.with_vcpus(vcpus);
        }
        for (name, value) in &request.api_keys {
            config = config.with_env(name.clone(), value.clone());
        }
        let sandbox = self
            .registry
            .provider()
            .create(config)
            .await
            .map_err(classify_creation_error)?;
        self.registry
            .register(&request.task_id, sandbox.clone(), request.keep_alive);
        logger
            .success(&format!("Sandbox {} created", sandbox.id()))
            .await;
        self.checkpoint("sandbox creation")?;

        let stage = Stage::new(sandbox.clone(), logger.clone());

        self.report_progress(30, "Cloning repository");
        clone_repository(&stage, state).await?;

        detect_project(&stage, state).await;

        if request.install_dependencies {
            self.report_progress(45, "Installing dependencies");
            deps::install(&stage, &self.settings, state).await;
        } else {
            logger.info("Skipping dependency installation").await;
        }
        self.checkpoint("dependency installation")?;

        if state.dependencies_installed && state.has_package_json {
            self.report_progress(65, "Starting dev server");
            dev_server::start(&stage, &self.settings, state).await;
        }

        self.checkpoint("dev server")?;
        self.report_progress(80, "Configuring git");
        let author_name = request
            .git_author_name
            .as_deref()
            .unwrap_or(&self.settings.git_author_name);
        let author_email = request
            .git_author_email
            .as_deref()
            .unwrap_or(&self.settings.git_author_email);
        git::configure(&stage, author_name, author_email, state).await?;

        self.report_progress(90, "Preparing branch");
        let branch_name = git::prepare_branch(&stage, request.branch_name.as_deref()).await?;

        let domain = state
            .domain
            .clone()
            .unwrap_or_else(|| sandbox.domain(state.dev_port));
        Ok((sandbox, domain, branch_name))
    }
}

fn classify_creation_error(error: Error) -> Error {
    if error.is_timeout() {
        return Error::SandboxTimeout("try a smaller repository".to_string());
    }
    match error {
        Error::SandboxCreation(_) | Error::ImageBuild { .. } => error,
        other => Error::SandboxCreation(other.to_string()),
    }
}

async fn clone_repository(stage: &Stage, state: &WorkflowState) -> Result<()> {
    let url = state
        .clone_url
        .as_ref()
        .ok_or_else(|| Error::Clone("no clone URL resolved".to_string()))?;

    let mkdir = stage
        .run(RunCommandRequest::new("mkdir").args(["-p", PROJECT_DIR]))
        .await?;
    if !mkdir.success() {
        return Err(Error::Clone(format!(
            "cannot create {}: {}",
            PROJECT_DIR,
            failure_reason(&mkdir)
        )));
    }

    stage.logger.info("Cloning repository").await;
    let clone = stage
        .run_in_project(
            RunCommandRequest::new("git").args(["clone", "--depth", "1", url.expose(), "."]),
        )
        .await?;
    if !clone.success() {
        return Err(Error::Clone(failure_reason(&clone)));
    }

    stage.logger.success("Repository cloned").await;
    Ok(())
}

async fn detect_project(stage: &Stage, state: &mut WorkflowState) {
    let exists = |file: &str| {
        let path = format!("{}/{}", PROJECT_DIR, file);
        let sandbox = stage.sandbox.clone();
        async move { sandbox.file_exists(&path).await.unwrap_or(false) }
    };

    state.has_package_json = exists("package.json").await;
    state.has_requirements = exists("requirements.txt").await;

    tracing::debug!(
        package_json = state.has_package_json,
        requirements = state.has_requirements,
        "detected project files"
    );
}
