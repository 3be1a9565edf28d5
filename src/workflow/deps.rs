//! Dependency installation. Every failure here is logged and swallowed.

use crate::package_manager::{self, PackageManager};
use crate::process::{shell_quote, RunCommandRequest};
use crate::sandbox::PROJECT_DIR;
use crate::settings::Settings;

use super::{failure_reason, succeeded, Stage, WorkflowState};

/// Installs Node or Python dependencies. Node wins if both are present.
pub(super) async fn install(stage: &Stage, settings: &Settings, state: &mut WorkflowState) {
    state.dependencies_installed = if state.has_package_json {
        install_node(stage, state).await
    } else if state.has_requirements {
        install_python(stage, settings).await
    } else {
        stage
            .logger
            .info("No package.json or requirements.txt, nothing to install")
            .await;
        false
    };
}

async fn install_node(stage: &Stage, state: &mut WorkflowState) -> bool {
    let detected = match package_manager::detect(&stage.sandbox, PROJECT_DIR).await {
        Ok(manager) => manager,
        Err(e) => {
            tracing::warn!(error = %e, "package manager detection failed, assuming npm");
            PackageManager::Npm
        }
    };

    let mut manager = detected;
    if manager != PackageManager::Npm
        && !package_manager::ensure_installed(&stage.sandbox, manager).await
    {
        stage
            .logger
            .warn(&format!(
                "Detected {} but could not install it, using npm instead",
                detected
            ))
            .await;
        manager = PackageManager::Npm;
    }
    state.package_manager = Some(manager);

    stage
        .logger
        .info(&format!("Installing dependencies with {}", manager))
        .await;
    if run_install(stage, manager).await {
        stage.logger.success("Dependencies installed").await;
        return true;
    }

    if manager != PackageManager::Npm {
        stage
            .logger
            .warn(&format!("{} install failed, retrying with npm", manager))
            .await;
        if run_install(stage, PackageManager::Npm).await {
            state.package_manager = Some(PackageManager::Npm);
            stage.logger.success("Dependencies installed with npm").await;
            return true;
        }
    }

    stage
        .logger
        .warn("Dependency installation failed, continuing without dependencies")
        .await;
    false
}

async fn run_install(stage: &Stage, manager: PackageManager) -> bool {
    let request =
        RunCommandRequest::new(manager.binary()).args(manager.install_args().iter().copied());

    match stage.run_in_project(request).await {
        Ok(output) if output.success() => true,
        Ok(output) => {
            tracing::warn!(manager = %manager, reason = %failure_reason(&output), "install failed");
            false
        }
        Err(e) => {
            tracing::warn!(manager = %manager, error = %e, "install failed");
            false
        }
    }
}

async fn install_python(stage: &Stage, settings: &Settings) -> bool {
    if !ensure_pip(stage, settings).await {
        stage
            .logger
            .warn("pip is unavailable, skipping Python dependencies")
            .await;
        return false;
    }

    stage.logger.info("Installing Python dependencies").await;
    let install = stage
        .run_in_project(
            RunCommandRequest::new("python3").args(["-m", "pip", "install", "-r", "requirements.txt"]),
        )
        .await;

    match install {
        Ok(output) if output.success() => {
            stage.logger.success("Python dependencies installed").await;
            true
        }
        Ok(output) => {
            stage
                .logger
                .warn(&format!(
                    "pip install failed, continuing without dependencies: {}",
                    failure_reason(&output)
                ))
                .await;
            false
        }
        Err(e) => {
            stage
                .logger
                .warn(&format!("pip install failed, continuing without dependencies: {}", e))
                .await;
            false
        }
    }
}

/// Makes `python3 -m pip` usable: upgrade if present, else bootstrap it,
/// else install it from the OS packages.
async fn ensure_pip(stage: &Stage, settings: &Settings) -> bool {
    let check = stage
        .run(RunCommandRequest::new("python3").args(["-m", "pip", "--version"]))
        .await;

    if succeeded(&check) {
        let upgrade = stage
            .run(RunCommandRequest::new("python3").args(["-m", "pip", "install", "--upgrade", "pip"]))
            .await;
        if !succeeded(&upgrade) {
            tracing::warn!("pip upgrade failed, using installed version");
        }
        return true;
    }

    stage.logger.info("pip not found, bootstrapping it").await;
    let bootstrap = format!(
        "curl -fsSL {} -o /tmp/get-pip.py && python3 /tmp/get-pip.py",
        shell_quote(&settings.pip_bootstrap_url)
    );
    let result = stage
        .run(RunCommandRequest::new("sh").args(["-c", bootstrap.as_str()]))
        .await;
    if succeeded(&result) {
        return true;
    }

    stage
        .logger
        .warn("pip bootstrap failed, installing python3-pip with apt-get")
        .await;
    let result = stage
        .run(
            RunCommandRequest::new("sh")
                .args(["-c", "apt-get update && apt-get install -y python3-pip"])
                .env("DEBIAN_FRONTEND", "noninteractive")
                .sudo(),
        )
        .await;
    succeeded(&result)
}
