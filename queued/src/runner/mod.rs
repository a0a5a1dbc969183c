//! Concrete implementation on running grader images.
//!
//! This module knows nothing about jobs or results. See [`crate::worker`] for
//! the code that drives it.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use tokio_util::sync::CancellationToken;

use crate::err::JobExecErr;

use self::model::{MountPaths, SandboxConfig};

pub mod exec;
pub mod image;
pub mod model;
mod util;
pub mod volume;

/// The container engine as seen by the worker.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Best-effort pull of `cfg.image`. Failures are only reported, the image
    /// may already be present locally.
    async fn pull_image(&self, cfg: &SandboxConfig) -> anyhow::Result<()>;

    /// Read the output and submission mount paths declared by `image`.
    async fn mount_paths(&self, image: &str) -> Result<MountPaths, JobExecErr>;

    /// Run the sandbox to completion, returning its diagnostic stream.
    async fn execute(
        &self,
        cfg: &SandboxConfig,
        cancel: &CancellationToken,
    ) -> Result<String, JobExecErr>;

    fn name(&self) -> std::borrow::Cow<'static, str>;
}

/// [`SandboxRuntime`] backed by a docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    /// Where the docker client configuration lives, for credential lookup.
    docker_config_dir: Option<PathBuf>,
}

impl DockerRuntime {
    pub fn new(docker: Docker, docker_config_dir: Option<PathBuf>) -> DockerRuntime {
        DockerRuntime {
            docker,
            docker_config_dir,
        }
    }

    /// Connect to the local daemon using the platform defaults.
    pub fn connect(docker_config_dir: Option<PathBuf>) -> anyhow::Result<DockerRuntime> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(DockerRuntime::new(docker, docker_config_dir))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn pull_image(&self, cfg: &SandboxConfig) -> anyhow::Result<()> {
        image::pull_image(&self.docker, cfg, self.docker_config_dir.as_deref()).await
    }

    async fn mount_paths(&self, image: &str) -> Result<MountPaths, JobExecErr> {
        image::discover_mount_paths(&self.docker, image).await
    }

    async fn execute(
        &self,
        cfg: &SandboxConfig,
        cancel: &CancellationToken,
    ) -> Result<String, JobExecErr> {
        exec::execute(&self.docker, cfg, cancel).await
    }

    fn name(&self) -> std::borrow::Cow<'static, str> {
        "docker".into()
    }
}
