//! Agent Sandbox - container sandboxes for AI coding agents
//!
//! This library provisions one isolated container per task, clones the task's
//! repository into it, installs dependencies, starts the dev server and checks
//! out a working branch, then keeps track of the sandbox until the task ends.

pub mod config;
pub mod error;
pub mod logger;
pub mod package_manager;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod secrets;
pub mod settings;
pub mod workflow;

pub use config::{Validate, ValidationResult, KNOWN_AGENTS};
pub use error::{Error, Result};
pub use logger::{ProgressCallback, RedactingLogger, TaskLogger, TracingTaskLogger};
pub use package_manager::PackageManager;
pub use process::{CommandOutput, OutputLine, OutputSink, ProcessRunner, RunCommandRequest};
pub use registry::{SandboxRegistry, SessionEnd};
pub use runtime::{CliRuntime, ContainerRuntime};
pub use sandbox::{
    ContainerProvider, ContainerSandbox, GitSource, ImageBuilder, SandboxConfig, SandboxMetadata,
    SandboxStatus,
};
pub use secrets::{Redactor, Secret};
pub use settings::Settings;
pub use workflow::{CreationWorkflow, ProvisionOutcome, ProvisionReport, ProvisionRequest};
