//! Base image management.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

/// Dockerfile for the sandbox base image.
pub const BASE_DOCKERFILE: &str = r#"FROM node:22-bookworm
RUN apt-get update \
    && apt-get install -y --no-install-recommends git curl ca-certificates python3 python3-venv \
    && rm -rf /var/lib/apt/lists/*
RUN useradd -m -s /bin/bash sandbox \
    && mkdir -p /workspace /cache \
    && chown sandbox:sandbox /workspace /cache
ENV npm_config_cache=/cache/npm \
    PIP_CACHE_DIR=/cache/pip \
    PIP_BREAK_SYSTEM_PACKAGES=1
USER sandbox
WORKDIR /workspace
CMD ["sleep", "infinity"]
"#;

/// Ensures the base image exists, building it at most once at a time.
///
/// Concurrent callers queue on the same lock; whoever gets it first builds
/// and the rest find the image ready. A failed build leaves the image
/// unmarked so the next caller retries.
pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    context_dir: PathBuf,
    ready: Mutex<bool>,
}

impl ImageBuilder {
    /// Creates a builder for `image`, writing the build context to a temp dir.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image: impl Into<String>) -> Self {
        Self {
            runtime,
            image: image.into(),
            context_dir: std::env::temp_dir().join("agent-sandbox-image"),
            ready: Mutex::new(false),
        }
    }

    /// Overrides the directory the build context is written to.
    pub fn with_context_dir(mut self, dir: PathBuf) -> Self {
        self.context_dir = dir;
        self
    }

    /// Returns the image tag.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Makes sure the image exists locally.
    pub async fn ensure(&self) -> Result<()> {
        let mut ready = self.ready.lock().await;
        if *ready {
            return Ok(());
        }

        let inspect = self
            .runtime
            .invoke(
                vec!["image".into(), "inspect".into(), self.image.clone()],
                None,
            )
            .await?;

        if inspect.success() {
            *ready = true;
            return Ok(());
        }

        tracing::info!(image = %self.image, "base image missing, building");
        self.build().await?;
        *ready = true;
        Ok(())
    }

    async fn build(&self) -> Result<()> {
        let build_error = |reason: String| Error::ImageBuild {
            image: self.image.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&self.context_dir)
            .await
            .map_err(|e| build_error(format!("cannot create build context: {}", e)))?;
        tokio::fs::write(self.context_dir.join("Dockerfile"), BASE_DOCKERFILE)
            .await
            .map_err(|e| build_error(format!("cannot write Dockerfile: {}", e)))?;

        let output = self
            .runtime
            .invoke(
                vec![
                    "image".into(),
                    "build".into(),
                    "-t".into(),
                    self.image.clone(),
                    self.context_dir.display().to_string(),
                ],
                None,
            )
            .await?;

        if !output.success() {
            return Err(build_error(output.stderr().trim().to_string()));
        }

        tracing::info!(image = %self.image, "built base image");
        Ok(())
    }
}
