//! Collecting what a grader left in its output directory.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use serde_json::json;

use crate::{
    err::JobExecErr,
    job::{Job, STUDENTS_FILE, TEACHERS_FILE},
    util::{short_id, tar::archive_dir},
};

use super::ResultEnvelope;

/// Prefix of the job copy stored next to the grader's output.
pub const JOB_COPY_PREFIX: &str = "__msg__";

/// Fills the artifact part of a [`ResultEnvelope`].
#[derive(Debug, Default, Clone)]
pub struct ResultCollector {}

impl ResultCollector {
    pub fn new() -> ResultCollector {
        ResultCollector {}
    }

    /// Read the well-known result files of `output_dir` and archive it.
    ///
    /// Nothing here aborts the job: every failure is recorded in `envelope`.
    /// A pretty-printed copy of `job` is part of the archive but removed from
    /// `output_dir` afterwards.
    pub async fn collect(&self, envelope: &mut ResultEnvelope, job: &Job, output_dir: &Path) {
        let students = self.read_artifact(envelope, output_dir, STUDENTS_FILE).await;
        envelope.students = students;
        let teachers = self.read_artifact(envelope, output_dir, TEACHERS_FILE).await;
        envelope.teachers = teachers;

        let job_copy = write_job_copy(output_dir, job).await;

        match archive_dir(output_dir).await {
            Ok(tar) => envelope.data = Some(general_purpose::STANDARD.encode(tar)),
            Err(e) => {
                tracing::warn!("Cannot create output archive: {}", e);
                envelope.record_collect_error(&JobExecErr::Archive(e));
            }
        }

        if let Some(path) = job_copy {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!("Cannot remove {}: {}", path.display(), e);
            }
        }
    }

    async fn read_artifact(
        &self,
        envelope: &mut ResultEnvelope,
        output_dir: &Path,
        file: &str,
    ) -> serde_json::Value {
        match read_json_object(&output_dir.join(file)).await {
            Ok(v) => v,
            Err(reason) => {
                let err = JobExecErr::ArtifactRead {
                    file: file.into(),
                    reason,
                };
                tracing::warn!("{}", err);
                let description = err.to_string();
                envelope.record_collect_error(&err);
                serde_json::Value::String(description)
            }
        }
    }
}

async fn read_json_object(path: &Path) -> Result<serde_json::Value, String> {
    let content = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_slice(&content).map_err(|e| e.to_string())?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("content is not a JSON object".into())
    }
}

/// Store the job next to the output. Falls back to a short note when the job
/// itself cannot be written.
async fn write_job_copy(output_dir: &Path, job: &Job) -> Option<PathBuf> {
    let path = output_dir.join(format!("{}{}.json", JOB_COPY_PREFIX, short_id()));

    let content = serde_json::to_vec_pretty(job).map_err(|e| e.to_string());
    let err = match content {
        Ok(content) => match tokio::fs::write(&path, content).await {
            Ok(()) => return Some(path),
            Err(e) => e.to_string(),
        },
        Err(e) => e,
    };
    tracing::warn!("Cannot save job copy to {}: {}", path.display(), err);

    let note = json!({
        "status": "cannot save input msg",
        "error": err,
    });
    let note = serde_json::to_vec_pretty(&note).unwrap_or_default();
    match tokio::fs::write(&path, note).await {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!("Cannot save error note to {}: {}", path.display(), e);
            None
        }
    }
}
