//! Request validation for provisioning.
//!
//! Validates requests before any sandbox is created, so misconfiguration is
//! caught at the cheapest point.

use crate::error::{Error, Result};
use crate::workflow::ProvisionRequest;

/// A coding agent and the credentials it can run with.
#[derive(Debug, Clone, Copy)]
pub struct AgentSpec {
    /// Agent identifier as used in requests.
    pub id: &'static str,
    /// API key names; any one of them is enough.
    pub credentials: &'static [&'static str],
}

/// Known coding agents.
pub const KNOWN_AGENTS: &[AgentSpec] = &[
    AgentSpec {
        id: "claude",
        credentials: &["ANTHROPIC_API_KEY"],
    },
    AgentSpec {
        id: "codex",
        credentials: &["OPENAI_API_KEY", "AI_GATEWAY_API_KEY"],
    },
    AgentSpec {
        id: "cursor",
        credentials: &["CURSOR_API_KEY"],
    },
    AgentSpec {
        id: "gemini",
        credentials: &["GEMINI_API_KEY"],
    },
    AgentSpec {
        id: "opencode",
        credentials: &["OPENAI_API_KEY", "ANTHROPIC_API_KEY"],
    },
];

/// Looks up an agent by id.
pub fn agent_spec(id: &str) -> Option<&'static AgentSpec> {
    KNOWN_AGENTS.iter().find(|a| a.id == id)
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for ProvisionRequest {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.task_id.trim().is_empty() {
            result.add_error("task id cannot be empty");
        }

        let url = self.repo_url.trim();
        if url.is_empty() {
            result.add_error("repository URL cannot be empty");
        } else if !(url.starts_with("https://")
            || url.starts_with("http://")
            || url.starts_with("git@")
            || url.starts_with("file://"))
        {
            result.add_error(format!("unsupported repository URL '{}'", url));
        }

        match agent_spec(&self.agent) {
            None => result.add_error(format!("unknown agent '{}'", self.agent)),
            Some(spec) => {
                let has_key = spec.credentials.iter().any(|name| {
                    self.api_keys
                        .get(*name)
                        .map(|v| !v.expose().is_empty())
                        .unwrap_or(false)
                });
                if !has_key {
                    result.add_error(format!(
                        "agent '{}' requires one of: {}",
                        spec.id,
                        spec.credentials.join(", ")
                    ));
                }
            }
        }

        if self.github_token.is_none() {
            result.add_warning("no GitHub token; private repositories will fail to clone");
        }

        if self.ports.iter().any(|p| *p == 0) {
            result.add_error("port 0 cannot be exposed");
        }

        if let Some(vcpus) = self.vcpus {
            if vcpus == 0 {
                result.add_error("vcpus must be at least 1");
            } else if vcpus > 8 {
                result.add_warning(format!("{} vcpus is more than a sandbox usually needs", vcpus));
            }
        }

        if let Some(email) = &self.git_author_email {
            if !email.contains('@') {
                result.add_warning(format!("git author email '{}' looks invalid", email));
            }
        }

        if let Some(branch) = &self.branch_name {
            if branch.trim().is_empty() || branch.starts_with('-') || branch.contains("..") {
                result.add_error(format!("invalid branch name '{}'", branch));
            }
        }

        result
    }
}
