use err_derive::Error;
use serde::Serialize;
use std::fmt::Debug;

/// Errors reported synchronously to a submitter.
#[derive(Debug, Error)]
pub enum AdmissionErr {
    #[error(display = "Invalid job: {}", _0)]
    Validation(#[error(source)] ValidationErr),

    #[error(display = "Queue is full")]
    Overloaded,

    #[error(display = "Queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ValidationErr {
    #[error(display = "Malformed JSON: {}", _0)]
    Json(#[error(source)] serde_json::Error),

    #[error(display = "Json schema validation failed: {}", _0)]
    Schema(String),
}

/// Who is to blame for a failed job, as reported in the result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    /// The image or the submitted code misbehaved.
    Submission,
    /// This service or the container engine failed.
    Infrastructure,
}

/// Everything that can go wrong with a single job once it has been admitted.
///
/// None of these abort the worker: they all end up in the result envelope.
#[derive(Debug, Error)]
pub enum JobExecErr {
    #[error(display = "Cannot discover mount paths of image {}: {}", image, reason)]
    ImageIntrospection { image: String, reason: String },

    #[error(display = "Cannot write submission file: {}", _0)]
    VolumeWrite(#[error(source)] std::io::Error),

    #[error(display = "Error on docker container create: {}", _0)]
    SandboxCreate(#[error(source, no_from)] bollard::errors::Error),

    #[error(display = "Error on docker attach: {}", _0)]
    SandboxAttach(#[error(source, no_from)] bollard::errors::Error),

    #[error(display = "Error on docker container start: {}", _0)]
    SandboxStart(#[error(source, no_from)] bollard::errors::Error),

    #[error(display = "TIMEOUT expired! Container ran longer than {} seconds", secs)]
    SandboxTimeout { secs: u64 },

    #[error(display = "Container exited incorrectly: {}", detail)]
    SandboxExit {
        code: Option<i64>,
        detail: String,
        stderr: String,
    },

    #[error(display = "Job was cancelled because the service is shutting down")]
    Cancelled,

    #[error(display = "Cannot read {}: {}", file, reason)]
    ArtifactRead { file: String, reason: String },

    #[error(display = "Cannot create output archive: {}", _0)]
    Archive(#[error(source, no_from)] std::io::Error),
}

impl JobExecErr {
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobExecErr::ImageIntrospection { .. }
            | JobExecErr::SandboxTimeout { .. }
            | JobExecErr::SandboxExit { .. }
            | JobExecErr::ArtifactRead { .. } => ErrorCategory::Submission,
            JobExecErr::VolumeWrite(_)
            | JobExecErr::SandboxCreate(_)
            | JobExecErr::SandboxAttach(_)
            | JobExecErr::SandboxStart(_)
            | JobExecErr::Cancelled
            | JobExecErr::Archive(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, JobExecErr::SandboxTimeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum DeliveryErr {
    #[error(display = "Web request error: {}", _0)]
    Request(#[error(source)] reqwest::Error),

    #[error(display = "Forward request failed with status {}: {}", status, body)]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigErr {
    #[error(display = "Cannot read config file {}: {}", path, source)]
    Read {
        path: String,
        #[error(source)]
        source: std::io::Error,
    },

    #[error(display = "Cannot parse config file: {}", _0)]
    Json(#[error(source)] serde_json::Error),

    #[error(display = "Cannot parse config file: {}", _0)]
    Toml(#[error(source)] toml::de::Error),

    #[error(display = "No job source configured: set either `mq_read_service_addr` or `server_port`")]
    NoJobSource,

    #[error(display = "Invalid listen address {}: {}", _0, _1)]
    ListenAddr(String, std::io::Error),
}
