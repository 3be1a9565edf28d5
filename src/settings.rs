//! Runtime settings for sandbox provisioning.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables:
//!
//! - `AGENT_SANDBOX_CONFIG` - path to the TOML file
//! - `AGENT_SANDBOX_RUNTIME` - container runtime binary (default `docker`)
//! - `AGENT_SANDBOX_IMAGE` - base image tag
//! - `AGENT_SANDBOX_PUBLIC_HOST` - host used to build dev server URLs

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ports exposed when a request doesn't name any.
pub const DEFAULT_PORTS: [u16; 2] = [3000, 5173];

/// Settings shared by every provisioning run in this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Container runtime CLI binary.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Tag of the base image sandboxes run from.
    #[serde(default = "default_image")]
    pub image: String,

    /// Host part of dev server URLs.
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// URL scheme of dev server URLs.
    #[serde(default = "default_public_scheme")]
    pub public_scheme: String,

    /// Ports exposed when a request doesn't name any.
    #[serde(default = "default_ports")]
    pub default_ports: Vec<u16>,

    /// Commit author name used inside sandboxes.
    #[serde(default = "default_git_author_name")]
    pub git_author_name: String,

    /// Commit author email used inside sandboxes.
    #[serde(default = "default_git_author_email")]
    pub git_author_email: String,

    /// How long a detached command must survive to count as started.
    #[serde(default = "default_detached_grace_ms")]
    pub detached_grace_ms: u64,

    /// Pause after launching the dev server so it can bind its port.
    #[serde(default = "default_dev_server_settle_ms")]
    pub dev_server_settle_ms: u64,

    /// Sandbox lifetime when the request doesn't give one.
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u64,

    /// Installer used when `pip` is missing from the image.
    #[serde(default = "default_pip_bootstrap_url")]
    pub pip_bootstrap_url: String,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "agent-sandbox:latest".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_public_scheme() -> String {
    "http".to_string()
}

fn default_ports() -> Vec<u16> {
    DEFAULT_PORTS.to_vec()
}

fn default_git_author_name() -> String {
    "Coding Agent".to_string()
}

fn default_git_author_email() -> String {
    "agent@example.com".to_string()
}

fn default_detached_grace_ms() -> u64 {
    500
}

fn default_dev_server_settle_ms() -> u64 {
    3000
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_pip_bootstrap_url() -> String {
    "https://bootstrap.pypa.io/get-pip.py".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            public_host: default_public_host(),
            public_scheme: default_public_scheme(),
            default_ports: default_ports(),
            git_author_name: default_git_author_name(),
            git_author_email: default_git_author_email(),
            detached_grace_ms: default_detached_grace_ms(),
            dev_server_settle_ms: default_dev_server_settle_ms(),
            default_timeout_minutes: default_timeout_minutes(),
            pip_bootstrap_url: default_pip_bootstrap_url(),
        }
    }
}

impl Settings {
    /// Parses settings from TOML text. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid settings: {}", e)))
    }

    /// Reads settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Loads settings from `AGENT_SANDBOX_CONFIG` (if set) plus env overrides.
    pub fn load() -> Result<Self> {
        let mut settings = match std::env::var("AGENT_SANDBOX_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Applies environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Some(v) = non_empty_env("AGENT_SANDBOX_RUNTIME") {
            self.runtime = v;
        }
        if let Some(v) = non_empty_env("AGENT_SANDBOX_IMAGE") {
            self.image = v;
        }
        if let Some(v) = non_empty_env("AGENT_SANDBOX_PUBLIC_HOST") {
            self.public_host = v;
        }
    }

    pub fn detached_grace(&self) -> Duration {
        Duration::from_millis(self.detached_grace_ms)
    }

    pub fn dev_server_settle(&self) -> Duration {
        Duration::from_millis(self.dev_server_settle_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_minutes * 60)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_have_sensible_defaults() {
        let settings = Settings::default();

        assert_eq!(settings.runtime, "docker");
        assert_eq!(settings.default_ports, vec![3000, 5173]);
        assert_eq!(settings.detached_grace(), Duration::from_millis(500));
        assert_eq!(settings.dev_server_settle(), Duration::from_secs(3));
        assert_eq!(settings.default_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            runtime = "podman"
            default_ports = [8080]
            "#,
        )
        .expect("should parse");

        assert_eq!(settings.runtime, "podman");
        assert_eq!(settings.default_ports, vec![8080]);
        assert_eq!(settings.image, "agent-sandbox:latest");
        assert_eq!(settings.git_author_name, "Coding Agent");
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = Settings::from_toml("runtime = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn settings_load_from_file() {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("sandbox.toml");
        std::fs::write(&path, "public_host = \"sandbox.test\"\n").expect("failed to write");

        let settings = Settings::from_file(&path).expect("should load");
        assert_eq!(settings.public_host, "sandbox.test");
    }
}
