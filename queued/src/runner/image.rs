//! Pulling grader images and reading their mount contract.

use std::{collections::HashMap, path::Path, time::Duration};

use base64::{engine::general_purpose, Engine as _};
use bollard::{
    auth::DockerCredentials,
    container::{Config, InspectContainerOptions, RemoveContainerOptions},
    image::CreateImageOptions,
    Docker,
};
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::{err::JobExecErr, runner::util::is_recoverable_error};

use super::model::{MountPaths, SandboxConfig};

pub const PULL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Key docker uses for Docker Hub inside `config.json`.
pub const DOCKER_HUB_REGISTRY: &str = "https://index.docker.io/v1/";

/// Pull `cfg.image`, draining the progress stream.
///
/// Credentials come from `cfg` when present, otherwise from the docker client
/// configuration found in `docker_config_dir`.
pub async fn pull_image(
    docker: &Docker,
    cfg: &SandboxConfig,
    docker_config_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let credentials = match &cfg.credentials {
        Some(c) => Some(c.clone()),
        None => match docker_config_dir {
            Some(dir) => lookup_credentials(dir, registry_of(&cfg.image))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        "Cannot get auth for {} from default cred store: {:#}",
                        cfg.image,
                        e
                    );
                    None
                }),
            None => None,
        },
    };

    let pull = async {
        let mut create_img = docker.create_image(
            Some(CreateImageOptions {
                from_image: cfg.image.as_str(),
                ..Default::default()
            }),
            None,
            credentials,
        );
        while let Some(res) = create_img.next().await {
            match res {
                Ok(info) => {
                    if let Some(e) = info.error {
                        return Err(anyhow::anyhow!("Unable to pull image: {}", e));
                    }
                }
                Err(e) if is_recoverable_error(&e) => {
                    tracing::debug!("Ignoring malformed pull progress: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    };

    tokio::time::timeout(PULL_TIMEOUT, pull)
        .await
        .map_err(|_| anyhow::anyhow!("Pulling {} timed out", cfg.image))?
}

/// Discover where `image` wants its output and submission volumes.
///
/// The image config is read through a throwaway container that is never
/// started and has networking disabled.
pub async fn discover_mount_paths(docker: &Docker, image: &str) -> Result<MountPaths, JobExecErr> {
    let introspection_err = |reason: String| JobExecErr::ImageIntrospection {
        image: image.to_owned(),
        reason,
    };

    let inspect = async {
        let container = docker
            .create_container::<String, String>(
                None,
                Config {
                    image: Some(image.to_owned()),
                    network_disabled: Some(true),
                    host_config: Some(bollard::service::HostConfig {
                        auto_remove: Some(true),
                        network_mode: Some("none".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| introspection_err(format!("error while creating container: {}", e)))?;

        let inspected = docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await;

        // Containers that never started are not auto-removed.
        if let Err(e) = docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            tracing::warn!("Cannot remove inspection container {}: {}", container.id, e);
        }

        let inspected = inspected
            .map_err(|e| introspection_err(format!("error while inspecting container: {}", e)))?;
        let env = inspected
            .config
            .and_then(|c| c.env)
            .unwrap_or_default();
        MountPaths::from_env(env.iter().map(String::as_str)).map_err(introspection_err)
    };

    tokio::time::timeout(INSPECT_TIMEOUT, inspect)
        .await
        .map_err(|_| introspection_err("timed out".into()))?
}

/// The registry part of an image reference, as used for `config.json` keys.
pub fn registry_of(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DOCKER_HUB_REGISTRY,
    }
}

fn registry_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key);
    match host {
        "docker.io" | "registry-1.docker.io" => "index.docker.io",
        _ => host,
    }
}

#[derive(Debug, Deserialize, Default)]
struct DockerClientConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
}

/// Look `registry` up in `<config_dir>/config.json`.
///
/// Returns `Ok(None)` when the file or the entry does not exist. Credential
/// helpers are not consulted.
pub async fn lookup_credentials(
    config_dir: &Path,
    registry: &str,
) -> anyhow::Result<Option<DockerCredentials>> {
    let content = match tokio::fs::read(config_dir.join("config.json")).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let cfg: DockerClientConfig = serde_json::from_slice(&content)?;

    let wanted = registry_host(registry);
    let entry = cfg
        .auths
        .into_iter()
        .find(|(key, _)| registry_host(key) == wanted);
    let (key, entry) = match entry {
        Some(e) => e,
        None => {
            if let Some(store) = cfg.creds_store {
                tracing::debug!(
                    "No inline auth for {}; credential store `{}` is not supported",
                    registry,
                    store
                );
            }
            return Ok(None);
        }
    };

    let (mut username, mut password) = (entry.username, entry.password);
    if let Some(auth) = entry.auth.filter(|x| !x.is_empty()) {
        let decoded = general_purpose::STANDARD.decode(auth.trim())?;
        let decoded = String::from_utf8(decoded)?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Malformed auth entry for {}", key))?;
        username = Some(user.to_owned());
        password = Some(pass.to_owned());
    }

    Ok(Some(DockerCredentials {
        username,
        password,
        identitytoken: entry.identitytoken,
        serveraddress: Some(key),
        ..Default::default()
    }))
}
