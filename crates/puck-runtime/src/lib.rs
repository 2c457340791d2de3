//! Thin capability contract over the external container runtime.
//!
//! The lifecycle manager consumes this trait; `PodmanRuntime` implements it
//! against a real Podman daemon and `MockRuntime` stands in for tests, so
//! lifecycle behavior can be exercised without a container engine present.

use std::path::PathBuf;

use async_trait::async_trait;
use puck_common::Result;

mod podman;

pub mod mock;

pub use podman::{detect_podman_socket, PodmanRuntime};

/// Options for creating a container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOpts {
    pub name: String,
    pub image: String,
    /// Host path -> container path bind mounts, mounted read-write.
    pub binds: Vec<BindMount>,
    /// "host:container" TCP port mappings.
    pub ports: Vec<String>,
    pub labels: Vec<(String, String)>,
    /// Run an init system inside the container so it behaves like a machine.
    pub init: bool,
}

#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

/// Options for checkpointing a running container.
#[derive(Debug, Clone)]
pub struct CheckpointOpts {
    /// Where to export the checkpoint archive.
    pub export_path: PathBuf,
    /// Keep the container running after the checkpoint completes.
    pub leave_running: bool,
}

/// Options for restoring a container from a checkpoint archive.
#[derive(Debug, Clone)]
pub struct RestoreOpts {
    pub import_path: PathBuf,
    /// Name for the restored container.
    pub name: String,
}

/// Options for executing a command inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub cmd: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub workdir: Option<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
}

/// Observed container state from an inspect call.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    pub ip: Option<String>,
}

/// The capability set the lifecycle manager depends on. References accept a
/// container name or opaque runtime id interchangeably.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image iff it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its opaque runtime id.
    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String>;

    async fn start_container(&self, reference: &str) -> Result<()>;

    /// Stop with a 10-second grace timeout.
    async fn stop_container(&self, reference: &str) -> Result<()>;

    async fn remove_container(&self, reference: &str, force: bool) -> Result<()>;

    async fn inspect(&self, reference: &str) -> Result<ContainerState>;

    /// Checkpoint a running container, including established TCP connections
    /// so open sockets survive the restore.
    async fn checkpoint(&self, reference: &str, opts: CheckpointOpts) -> Result<()>;

    /// Restore a container from an archive. Returns the **new** runtime id.
    async fn restore(&self, opts: RestoreOpts) -> Result<String>;

    /// Run a command in the container, piping the caller's stdio when
    /// interactive. Returns the command's exit status.
    async fn exec(&self, reference: &str, opts: ExecOpts) -> Result<i32>;

    /// Connectivity probe; used at daemon boot.
    async fn ping(&self) -> Result<()>;

    async fn is_running(&self, reference: &str) -> Result<bool> {
        Ok(self.inspect(reference).await?.running)
    }

    async fn container_ip(&self, reference: &str) -> Result<Option<String>> {
        Ok(self.inspect(reference).await?.ip)
    }

    async fn container_exists(&self, reference: &str) -> Result<bool> {
        match self.inspect(reference).await {
            Ok(_) => Ok(true),
            Err(puck_common::Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open an interactive shell, piping the caller's stdio.
    async fn console(&self, reference: &str, shell: &str) -> Result<i32> {
        let shell = if shell.is_empty() { "/bin/bash" } else { shell };
        self.exec(
            reference,
            ExecOpts {
                cmd: vec![shell.to_string()],
                interactive: true,
                tty: true,
                ..Default::default()
            },
        )
        .await
    }
}
