//! Node package manager detection and installation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::RunCommandRequest;
use crate::sandbox::ContainerSandbox;

/// A Node package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    /// Binary name.
    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }

    /// Lockfile whose presence selects this manager.
    pub fn lockfile(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Yarn => "yarn.lock",
        }
    }

    /// Arguments for installing project dependencies.
    pub fn install_args(&self) -> &'static [&'static str] {
        match self {
            PackageManager::Npm => &["install", "--no-audit", "--no-fund"],
            PackageManager::Pnpm => &["install"],
            PackageManager::Yarn => &["install"],
        }
    }

    /// Arguments for running the `script` from package.json, with `extra`
    /// forwarded to the script.
    pub fn run_script_args(&self, script: &str, extra: &[String]) -> Vec<String> {
        let mut args = vec!["run".to_string(), script.to_string()];
        if !extra.is_empty() {
            if *self == PackageManager::Npm {
                args.push("--".to_string());
            }
            args.extend(extra.iter().cloned());
        }
        args
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Picks the package manager for the project in `dir` by lockfile.
///
/// `pnpm-lock.yaml` wins over `yarn.lock`; anything else is npm.
pub async fn detect(sandbox: &ContainerSandbox, dir: &str) -> Result<PackageManager> {
    for manager in [PackageManager::Pnpm, PackageManager::Yarn] {
        let lockfile = format!("{}/{}", dir.trim_end_matches('/'), manager.lockfile());
        if sandbox.file_exists(&lockfile).await? {
            return Ok(manager);
        }
    }
    Ok(PackageManager::Npm)
}

/// Makes sure `manager`'s binary is on the PATH, installing it globally with
/// npm if it isn't. Returns false if it is still unavailable.
pub async fn ensure_installed(sandbox: &ContainerSandbox, manager: PackageManager) -> bool {
    let which = sandbox
        .run_command(RunCommandRequest::new("which").arg(manager.binary()))
        .await;
    if matches!(&which, Ok(out) if out.success()) {
        return true;
    }

    let install = sandbox
        .run_command(
            RunCommandRequest::new("npm")
                .args(["install", "-g", manager.binary()])
                .sudo(),
        )
        .await;

    match install {
        Ok(out) if out.success() => true,
        Ok(out) => {
            tracing::warn!(
                manager = %manager,
                stderr = %out.stderr().trim(),
                "global package manager install failed"
            );
            false
        }
        Err(e) => {
            tracing::warn!(manager = %manager, error = %e, "global package manager install failed");
            false
        }
    }
}
