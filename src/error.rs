//! Error types for sandbox provisioning.

use thiserror::Error;

/// Top-level error type for sandbox and workflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The container runtime CLI rejected an invocation.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// IO error while spawning or talking to a process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No container exists for the given sandbox id.
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// The sandbox has no backing container yet.
    #[error("sandbox {0} has not been initialized")]
    NotInitialized(String),

    /// The sandbox was stopped and cannot run commands.
    #[error("sandbox {0} is stopped")]
    Stopped(String),

    /// Failed to create a sandbox.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    /// Sandbox creation ran out of time.
    #[error("sandbox creation timed out: {0}")]
    SandboxTimeout(String),

    /// Building the base image failed.
    #[error("failed to build image {image}: {reason}")]
    ImageBuild { image: String, reason: String },

    /// A detached process died inside its grace window.
    #[error("detached command exited early with code {code}: {stderr}")]
    DetachedExit { code: i32, stderr: String },

    /// Cloning the source repository failed.
    #[error("failed to clone repository: {0}")]
    Clone(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// Configuration or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The container metadata label could not be decoded.
    #[error("invalid sandbox metadata: {0}")]
    Metadata(String),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if this error looks like a timeout, by kind or by message.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::SandboxTimeout(_) => true,
            Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => true,
            other => {
                let msg = other.to_string().to_lowercase();
                msg.contains("timed out") || msg.contains("timeout") || msg.contains("etimedout")
            }
        }
    }

    /// Returns true if this is the cancellation outcome rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
