//! Container sandboxes for coding-agent tasks.
//!
//! [`ContainerProvider`] creates and reconnects [`ContainerSandbox`] handles;
//! [`ImageBuilder`] makes sure the base image exists; [`metadata`] encodes
//! the configuration label carried by each container.

mod container;
mod image;
pub mod metadata;

pub use container::{
    parse_inspect, ContainerProvider, ContainerSandbox, GitSource, InspectedContainer,
    SandboxConfig, SandboxStatus, CACHE_DIR, PROJECT_DIR,
};
pub use image::{ImageBuilder, BASE_DOCKERFILE};
pub use metadata::SandboxMetadata;
