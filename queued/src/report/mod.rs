//! Results of a job and how they get back to the submitter.

use serde::Serialize;
use serde_json::value::RawValue;

use crate::err::{ErrorCategory, JobExecErr};

pub mod collect;
pub mod delivery;

pub use collect::ResultCollector;
pub use delivery::DeliveryClient;

/// The document posted to `{returnUrl}/results`.
#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    /// Diagnostic stream of the sandbox, or a description of what failed.
    pub result: String,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    /// Parsed `students.json`, or a description of why it is unavailable.
    pub students: serde_json::Value,
    /// Parsed `teachers.json`, or a description of why it is unavailable.
    pub teachers: serde_json::Value,
    /// Base64 of a tar archive of the whole output directory.
    pub data: Option<String>,
    pub meta_data: Option<Box<RawValue>>,
    #[serde(skip)]
    run_failed: bool,
}

impl ResultEnvelope {
    pub fn new(meta_data: Option<Box<RawValue>>) -> ResultEnvelope {
        ResultEnvelope {
            meta_data,
            ..Default::default()
        }
    }

    /// Fill `result` from the outcome of a sandbox run.
    pub fn record_run(&mut self, outcome: &Result<String, JobExecErr>) {
        match outcome {
            Ok(stderr) => self.result = stderr.clone(),
            Err(JobExecErr::SandboxExit { stderr, .. }) => {
                self.result = stderr.clone();
                self.record_error(outcome.as_ref().err());
                self.run_failed = true;
            }
            Err(e) => {
                self.result = e.to_string();
                self.record_error(Some(e));
                self.run_failed = true;
            }
        }
    }

    /// Overwrite `error` and `errorCategory`. The last recorded error wins.
    pub fn record_error(&mut self, err: Option<&JobExecErr>) {
        if let Some(err) = err {
            self.error = Some(err.to_string());
            self.error_category = Some(err.category());
        }
    }

    /// Record an error found while collecting results. A failed run keeps its
    /// own error; collection errors only compete with each other.
    pub fn record_collect_error(&mut self, err: &JobExecErr) {
        if self.run_failed {
            tracing::debug!("Run already failed, not overriding its error with: {}", err);
            return;
        }
        self.record_error(Some(err));
    }
}
