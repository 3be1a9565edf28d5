//! Dev server launch.
//!
//! The server runs detached; only the fact that it produced output is
//! logged, never the output itself.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::process::{shell_quote, OutputLine, RunCommandRequest};
use crate::sandbox::PROJECT_DIR;
use crate::settings::Settings;

use super::{failure_reason, Stage, WorkflowState};

/// Vite override layered over the project's own config. Not committed.
pub const VITE_OVERRIDE_FILE: &str = "vite.sandbox.config.mjs";

/// Port Vite serves on inside the sandbox.
pub const VITE_PORT: u16 = 5173;

/// Binds all interfaces and accepts any Host header, on top of whatever
/// `vite.config.*` the project has.
pub const VITE_OVERRIDE_CONFIG: &str = r#"import { defineConfig, loadConfigFromFile, mergeConfig } from 'vite'

export default defineConfig(async (env) => {
  const loaded = await loadConfigFromFile(env, undefined, process.cwd())
  return mergeConfig(loaded?.config ?? {}, {
    server: {
      host: '0.0.0.0',
      port: 5173,
      strictPort: true,
      allowedHosts: true,
    },
  })
})
"#;

/// How to run a project's dev server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevServerPlan {
    /// package.json script to run.
    pub script: String,
    /// Arguments forwarded to the script.
    pub extra_args: Vec<String>,
    /// Port the server listens on, if it differs from the sandbox default.
    pub port: Option<u16>,
    /// Needs the Vite override file.
    pub vite: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    scripts: HashMap<String, String>,
    #[serde(default)]
    dependencies: HashMap<String, String>,
    #[serde(default)]
    dev_dependencies: HashMap<String, String>,
}

impl PackageJson {
    fn dependency(&self, name: &str) -> Option<&str> {
        self.dependencies
            .get(name)
            .or_else(|| self.dev_dependencies.get(name))
            .map(String::as_str)
    }
}

/// Major version from a semver range such as `^16.0.1` or `>=15`.
fn major_version(range: &str) -> Option<u64> {
    let digits: String = range
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Decides how to start the dev server from package.json text.
///
/// `Ok(None)` if there is no `dev` script.
pub fn analyze_package_json(text: &str) -> Result<Option<DevServerPlan>> {
    let package: PackageJson = serde_json::from_str(text)?;
    let Some(dev) = package.scripts.get("dev") else {
        return Ok(None);
    };

    // Keyed on the script: `vite` is often only a test dependency (vitest).
    let vite = dev
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|'))
        .any(|word| word == "vite" || word.ends_with("/vite"));

    let mut extra_args = Vec::new();
    if !vite && package.dependency("next").and_then(major_version) == Some(16) {
        extra_args.push("--webpack".to_string());
    }

    Ok(Some(DevServerPlan {
        script: "dev".to_string(),
        extra_args,
        port: vite.then_some(VITE_PORT),
        vite,
    }))
}

/// Starts the dev server detached and records its domain. Never fails.
pub(super) async fn start(stage: &Stage, settings: &Settings, state: &mut WorkflowState) {
    let manifest = stage
        .run(RunCommandRequest::new("cat").arg(format!("{}/package.json", PROJECT_DIR)))
        .await;
    let text = match manifest {
        Ok(output) if output.success() => output.stdout().to_string(),
        Ok(output) => {
            stage
                .logger
                .warn(&format!("Cannot read package.json: {}", failure_reason(&output)))
                .await;
            return;
        }
        Err(e) => {
            stage
                .logger
                .warn(&format!("Cannot read package.json: {}", e))
                .await;
            return;
        }
    };

    let plan = match analyze_package_json(&text) {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            stage.logger.info("No dev script, not starting a dev server").await;
            return;
        }
        Err(e) => {
            stage
                .logger
                .warn(&format!("Cannot parse package.json: {}", e))
                .await;
            return;
        }
    };

    let mut args = plan.extra_args.clone();
    if plan.vite {
        match install_vite_override(stage).await {
            Ok(()) => args.extend(["--config".to_string(), VITE_OVERRIDE_FILE.to_string()]),
            Err(e) => {
                stage
                    .logger
                    .warn(&format!("Could not write Vite override, using project config: {}", e))
                    .await
            }
        }
    }

    let manager = state.package_manager.unwrap_or_default();
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(report_output(stage.clone(), rx));

    let request = RunCommandRequest::new(manager.binary())
        .args(manager.run_script_args(&plan.script, &args))
        .detached()
        .sink(tx);

    match stage.run_in_project(request).await {
        Ok(_) => {
            stage.logger.info("Dev server starting").await;
            tokio::time::sleep(settings.dev_server_settle()).await;
        }
        Err(e) => {
            stage
                .logger
                .warn(&format!("Dev server failed to start: {}", e))
                .await;
        }
    }

    state.dev_port = plan.port;
    state.domain = Some(stage.sandbox.domain(plan.port));
}

async fn install_vite_override(stage: &Stage) -> Result<()> {
    stage
        .sandbox
        .write_file(
            &format!("{}/{}", PROJECT_DIR, VITE_OVERRIDE_FILE),
            VITE_OVERRIDE_CONFIG,
        )
        .await?;

    let exclude = format!(
        "if [ -d .git ]; then mkdir -p .git/info && {{ grep -qxF {f} .git/info/exclude 2>/dev/null || echo {f} >> .git/info/exclude; }}; fi",
        f = shell_quote(VITE_OVERRIDE_FILE)
    );
    let output = stage
        .run_in_project(RunCommandRequest::new("sh").args(["-c", exclude.as_str()]))
        .await?;
    if !output.success() {
        tracing::warn!(reason = %failure_reason(&output), "could not exclude Vite override from git");
    }
    Ok(())
}

async fn report_output(stage: Stage, mut rx: mpsc::Receiver<OutputLine>) {
    let mut saw_stdout = false;
    let mut saw_stderr = false;

    while let Some(line) = rx.recv().await {
        match line {
            OutputLine::Stdout(_) if !saw_stdout => {
                saw_stdout = true;
                stage.logger.info("Dev server is producing output").await;
            }
            OutputLine::Stderr(_) if !saw_stderr => {
                saw_stderr = true;
                stage.logger.info("Dev server wrote to stderr").await;
            }
            _ => {}
        }
    }
}
