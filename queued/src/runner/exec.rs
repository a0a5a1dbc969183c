//! Running a grader image to completion.

use std::time::Duration;

use bollard::{
    container::{
        AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
        KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        WaitContainerOptions,
    },
    Docker,
};
use bytes::BytesMut;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    err::JobExecErr,
    runner::util::{is_benign_kill_error, is_recoverable_error},
};

use super::model::{SandboxConfig, Volume};

/// Each captured stream is cut off after this many bytes.
pub const OUTPUT_SIZE_LIMIT: usize = 100 * 1024;
pub const KILL_TIMEOUT: Duration = Duration::from_secs(3);
/// Prefix of the names given to job containers.
pub const CONTAINER_PREFIX: &str = "queued-job-";

/// Run `cfg.image` once and return its standard error.
///
/// The whole create/attach/start/wait sequence is bounded by
/// [`SandboxConfig::deadline`]. When the deadline passes or `cancel` fires, the
/// container is killed. A container that never started is removed by name,
/// even when the deadline interrupted its creation.
pub async fn execute(
    docker: &Docker,
    cfg: &SandboxConfig,
    cancel: &CancellationToken,
) -> Result<String, JobExecErr> {
    let name = format!("{}{:016x}", CONTAINER_PREFIX, rand::random::<u64>());
    let mut started = false;

    let res = tokio::select! {
        res = tokio::time::timeout(
            cfg.deadline(),
            run_container(docker, cfg, &name, &mut started),
        ) => match res {
            Ok(res) => res,
            Err(_) => Err(JobExecErr::SandboxTimeout {
                secs: cfg.timeout.as_secs(),
            }),
        },
        _ = cancel.cancelled() => Err(JobExecErr::Cancelled),
    };

    if let Err(e) = &res {
        if started {
            if matches!(e, JobExecErr::SandboxTimeout { .. } | JobExecErr::Cancelled) {
                tracing::info!("Killing container {}: {}", name, e);
                kill_container(docker, &name).await;
            }
        } else {
            // `auto_remove` only applies to containers that have run.
            remove_container(docker, &name).await;
        }
    }
    res
}

async fn run_container(
    docker: &Docker,
    cfg: &SandboxConfig,
    name: &str,
    started: &mut bool,
) -> Result<String, JobExecErr> {
    let container = docker
        .create_container::<String, String>(
            Some(CreateContainerOptions {
                name: name.to_owned(),
                platform: None,
            }),
            Config {
                image: Some(cfg.image.clone()),
                env: Some(cfg.env()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                network_disabled: Some(true),
                host_config: Some(bollard::service::HostConfig {
                    mounts: Some(cfg.volumes.iter().map(Volume::to_mount).collect()),
                    memory: Some(cfg.memory).filter(|x| *x > 0),
                    network_mode: Some("none".into()),
                    auto_remove: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .map_err(JobExecErr::SandboxCreate)?;
    let id = container.id;
    tracing::debug!("Created container {} ({})", name, id);

    // The wait request must be registered before the container can exit.
    let wait = {
        let docker = docker.clone();
        let id = id.clone();
        tokio::spawn(async move {
            docker
                .wait_container(
                    &id,
                    Some(WaitContainerOptions {
                        condition: "next-exit",
                    }),
                )
                .next()
                .await
        })
    };

    let AttachContainerResults { mut output, .. } = docker
        .attach_container(
            &id,
            Some(AttachContainerOptions::<String> {
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| {
            wait.abort();
            JobExecErr::SandboxAttach(e)
        })?;
    tokio::task::yield_now().await;

    if let Err(e) = docker
        .start_container(&id, None::<StartContainerOptions<String>>)
        .await
    {
        wait.abort();
        return Err(JobExecErr::SandboxStart(e));
    }
    *started = true;

    let drain = async {
        let mut stdout = SizeConstraintBytesMut::new(OUTPUT_SIZE_LIMIT);
        let mut stderr = SizeConstraintBytesMut::new(OUTPUT_SIZE_LIMIT);
        while let Some(v) = output.next().await {
            match v {
                Ok(LogOutput::StdErr { message }) => stderr.append(&message),
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    stdout.append(&message)
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) if is_recoverable_error(&e) => continue,
                Err(e) => {
                    tracing::warn!("Output stream of container {} broke: {}", id, e);
                    break;
                }
            }
        }
        (stdout.into_string(), stderr.into_string())
    };

    let ((stdout, stderr), waited) = tokio::join!(drain, wait);
    tracing::debug!(stdout = %stdout, "Container {} finished", id);

    let (code, detail) = match waited {
        Ok(Some(Ok(resp))) if resp.status_code == 0 => return Ok(stderr),
        Ok(Some(Ok(resp))) => (
            Some(resp.status_code),
            resp.error.and_then(|e| e.message).unwrap_or_default(),
        ),
        Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code }))) => {
            (Some(code), error)
        }
        Ok(Some(Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        }))) => {
            // Removed before the wait was registered: it ran, the status is lost.
            tracing::warn!(
                "Container {} was gone before its exit status was read: {}",
                id,
                message
            );
            return Ok(stderr);
        }
        Ok(Some(Err(e))) => (None, e.to_string()),
        Ok(None) => (None, "wait stream ended without a status".into()),
        Err(e) => (None, e.to_string()),
    };
    let detail = match code {
        Some(code) if detail.is_empty() => format!("exit code {}", code),
        Some(code) => format!("exit code {}: {}", code, detail),
        None => detail,
    };
    Err(JobExecErr::SandboxExit {
        code,
        detail,
        stderr,
    })
}

/// Send `SIGKILL` to a container, ignoring the case where it is already gone.
pub async fn kill_container(docker: &Docker, id: &str) {
    let kill = docker.kill_container(id, Some(KillContainerOptions { signal: "KILL" }));
    match tokio::time::timeout(KILL_TIMEOUT, kill).await {
        Ok(Ok(())) => tracing::debug!("Killed container {}", id),
        Ok(Err(e)) if is_benign_kill_error(&e) => {
            tracing::debug!("Container {} already stopped: {}", id, e)
        }
        Ok(Err(e)) => tracing::error!("Cannot kill container {}: {}", id, e),
        Err(_) => tracing::error!("Killing container {} timed out", id),
    }
}

async fn remove_container(docker: &Docker, id: &str) {
    let remove = docker.remove_container(
        id,
        Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        }),
    );
    match tokio::time::timeout(KILL_TIMEOUT, remove).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if is_benign_kill_error(&e) => {}
        Ok(Err(e)) => tracing::warn!("Cannot remove container {}: {}", id, e),
        Err(_) => tracing::warn!("Removing container {} timed out", id),
    }
}

pub(crate) struct SizeConstraintBytesMut {
    size_limit: usize,
    bytes: BytesMut,
    truncated: bool,
}

impl SizeConstraintBytesMut {
    pub fn new(size_limit: usize) -> Self {
        SizeConstraintBytesMut {
            size_limit,
            bytes: BytesMut::new(),
            truncated: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let room = self.size_limit.saturating_sub(self.bytes.len());
        if room < bytes.len() {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Whether any appended bytes were dropped.
    pub fn is_oversized(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        let oversized = self.is_oversized();
        let mut s = String::from_utf8_lossy(&self.bytes).into_owned();
        if oversized {
            s.push_str(&format!(
                "\n--- output buffer capped out at {} bytes ---\n",
                self.size_limit
            ));
        }
        s
    }
}
