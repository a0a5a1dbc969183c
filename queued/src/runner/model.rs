use bollard::{auth::DockerCredentials, models::Mount};
use derive_builder::Builder;
use std::{path::PathBuf, time::Duration};

/// Extra time granted on top of a job's run time, for container startup and
/// teardown.
pub const STARTUP_GRACE: Duration = Duration::from_secs(2);

/// A host directory bound into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Path of the directory on this machine.
    pub host_path: PathBuf,
    /// Path under which the container sees it.
    pub guest_path: String,
    pub read_only: bool,
}

impl Volume {
    pub fn to_mount(&self) -> Mount {
        Mount {
            target: Some(self.guest_path.clone()),
            source: Some(self.host_path.display().to_string()),
            typ: Some(bollard::models::MountTypeEnum::BIND),
            read_only: Some(self.read_only),
            ..Default::default()
        }
    }
}

/// Configuration for one run of a grader image.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct SandboxConfig {
    pub image: String,

    #[builder(default)]
    pub volumes: Vec<Volume>,

    /// Run time granted to the grader. The container is killed after
    /// `timeout + STARTUP_GRACE`.
    pub timeout: Duration,

    /// Memory limit in bytes, `0` for unlimited.
    #[builder(default)]
    pub memory: i64,

    #[builder(default, setter(strip_option))]
    pub credentials: Option<DockerCredentials>,
}

impl SandboxConfig {
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Deadline for the whole create/attach/start/wait sequence.
    pub fn deadline(&self) -> Duration {
        self.timeout + STARTUP_GRACE
    }

    /// Environment passed into the sandbox.
    pub fn env(&self) -> Vec<String> {
        vec![format!("TIMEOUT={}", self.timeout.as_secs())]
    }
}

/// Guest paths an image declares for its volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPaths {
    /// `OUTPUT_PATH`: where the grader writes its results.
    pub output: String,
    /// `SUBMISSION_PATH`: where the grader expects the submitted files.
    pub submission: String,
}

pub const OUTPUT_PATH_ENV: &str = "OUTPUT_PATH";
pub const SUBMISSION_PATH_ENV: &str = "SUBMISSION_PATH";

impl MountPaths {
    /// Pick the mount paths out of an image's `KEY=value` environment list.
    pub fn from_env<'a>(env: impl IntoIterator<Item = &'a str>) -> Result<MountPaths, String> {
        let mut output = None;
        let mut submission = None;
        for entry in env {
            let (key, value) = match entry.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match key {
                OUTPUT_PATH_ENV => output = Some(value.trim().to_owned()),
                SUBMISSION_PATH_ENV => submission = Some(value.trim().to_owned()),
                _ => {}
            }
        }
        let require = |v: Option<String>, name: &str| {
            v.filter(|x| !x.is_empty())
                .ok_or_else(|| format!("image does not declare `{}` in its environment", name))
        };
        Ok(MountPaths {
            output: require(output, OUTPUT_PATH_ENV)?,
            submission: require(submission, SUBMISSION_PATH_ENV)?,
        })
    }
}
