//! Provisioning request and outcome types.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::package_manager::PackageManager;
use crate::sandbox::ContainerSandbox;
use crate::secrets::{Redactor, Secret};

/// Everything needed to provision one task's sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Task the sandbox belongs to; the registry key.
    pub task_id: String,
    /// Repository to clone.
    pub repo_url: String,
    /// Token embedded in the clone URL.
    pub github_token: Option<Secret>,
    /// Coding agent identifier (`claude`, `codex`, ...).
    pub agent: String,
    /// API keys by environment variable name, injected into the container.
    pub api_keys: BTreeMap<String, Secret>,
    /// Install project dependencies and start the dev server.
    pub install_dependencies: bool,
    /// Sandbox lifetime such as `"30"` or `"45m"`; digits are minutes.
    pub max_duration: Option<String>,
    /// Container ports to expose. Empty means the configured defaults.
    pub ports: Vec<u16>,
    pub git_author_name: Option<String>,
    pub git_author_email: Option<String>,
    /// Predetermined working branch.
    pub branch_name: Option<String>,
    pub vcpus: Option<u32>,
    /// Leave the sandbox running when the task's session ends.
    pub keep_alive: bool,
}

impl ProvisionRequest {
    pub fn new(
        task_id: impl Into<String>,
        repo_url: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            repo_url: repo_url.into(),
            github_token: None,
            agent: agent.into(),
            api_keys: BTreeMap::new(),
            install_dependencies: true,
            max_duration: None,
            ports: Vec::new(),
            git_author_name: None,
            git_author_email: None,
            branch_name: None,
            vcpus: None,
            keep_alive: false,
        }
    }

    pub fn with_github_token(mut self, token: Secret) -> Self {
        self.github_token = Some(token);
        self
    }

    pub fn with_api_key(mut self, name: impl Into<String>, value: Secret) -> Self {
        self.api_keys.insert(name.into(), value);
        self
    }

    pub fn with_install_dependencies(mut self, install: bool) -> Self {
        self.install_dependencies = install;
        self
    }

    pub fn with_max_duration(mut self, duration: impl Into<String>) -> Self {
        self.max_duration = Some(duration.into());
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_git_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.git_author_name = Some(name.into());
        self.git_author_email = Some(email.into());
        self
    }

    pub fn with_branch_name(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = Some(vcpus);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Redactor covering every credential in this request.
    pub fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        if let Some(token) = &self.github_token {
            redactor.add("GITHUB_TOKEN", token);
        }
        for (name, value) in &self.api_keys {
            redactor.add(name.clone(), value);
        }
        redactor
    }
}

/// Parses a user-supplied duration. All digits in the string are read as a
/// number of minutes; missing, zero or digitless input gives `default`.
pub fn parse_timeout(input: Option<&str>, default: Duration) -> Duration {
    let digits: String = input
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();

    match digits.parse::<u64>() {
        Ok(minutes) if minutes > 0 => Duration::from_secs(minutes.saturating_mul(60)),
        _ => default,
    }
}

/// Synthesizes a working branch name: `agent/<unix seconds>-<6 hex chars>`.
pub fn generate_branch_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("agent/{}-{}", secs, &suffix[..6])
}

/// Per-run provisioning state. Discarded when the run ends.
#[derive(Debug, Default)]
pub(crate) struct WorkflowState {
    pub has_package_json: bool,
    pub has_requirements: bool,
    pub package_manager: Option<PackageManager>,
    pub dependencies_installed: bool,
    pub dev_port: Option<u16>,
    pub domain: Option<String>,
    pub clone_url: Option<Secret>,
    pub timeout: Duration,
}

/// The three ways a provisioning run can end.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// The sandbox is running with the working branch checked out.
    Ready {
        sandbox: Arc<ContainerSandbox>,
        domain: String,
        branch_name: String,
    },
    /// Cancellation was requested at a checkpoint.
    Cancelled,
    /// A fatal stage failed. The message is already redacted.
    Failed { error: String },
}

impl ProvisionOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProvisionOutcome::Ready { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionOutcome::Cancelled)
    }

    /// Serializable summary of the outcome.
    pub fn report(&self) -> ProvisionReport {
        match self {
            ProvisionOutcome::Ready {
                sandbox,
                domain,
                branch_name,
            } => ProvisionReport {
                success: true,
                cancelled: false,
                sandbox_id: Some(sandbox.id().to_string()),
                domain: Some(domain.clone()),
                branch_name: Some(branch_name.clone()),
                error: None,
            },
            ProvisionOutcome::Cancelled => ProvisionReport {
                success: false,
                cancelled: true,
                ..ProvisionReport::default()
            },
            ProvisionOutcome::Failed { error } => ProvisionReport {
                success: false,
                cancelled: false,
                error: Some(error.clone()),
                ..ProvisionReport::default()
            },
        }
    }
}

/// JSON shape of a [`ProvisionOutcome`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
