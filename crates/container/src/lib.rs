//! Container lifecycle for the chef build platform.
//!
//! A container is a composed root filesystem, a sandboxed init process
//! reached over a control socket, and a security policy projected into the
//! kernel (seccomp at child entry, inode allow-map via the BPF LSM).

pub mod layers;
pub mod registry;
pub mod sandbox;

mod container;

pub use container::{
    Capabilities, Container, ContainerConfig, ContainerState, SpawnOptions, SpawnOutcome,
    TransferDirection,
};
pub use layers::{Layer, LayerContext, LayerKind};
pub use registry::ContainerRegistry;

use thiserror::Error;

/// Failures surfaced by container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("invalid container id: {0}")]
    InvalidContainerId(String),

    #[error("invalid mounts: {0}")]
    InvalidMounts(String),

    #[error("rootfs setup failed: {0}")]
    FailedRootfsSetup(#[source] chef_common::Error),

    #[error("container internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

impl From<ContainerError> for chef_common::Error {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::InvalidContainerId(id) => {
                chef_common::Error::NotFound(format!("container {id}"))
            }
            ContainerError::InvalidMounts(msg) => chef_common::Error::InvalidArgument(msg),
            ContainerError::FailedRootfsSetup(inner) => {
                chef_common::Error::RootfsSetup(inner.to_string())
            }
            ContainerError::Internal(msg) => chef_common::Error::Internal(msg),
        }
    }
}
