//! The job model and its admission schema.

use crate::{err::ValidationErr, util::whole_number};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Default run time budget: 300s for tests and 200s for the build.
pub const DEFAULT_MAX_RUN_TIME: u32 = 500;
pub const DEFAULT_MEMORY_MB: u64 = 2048;

/// Name of the file holding the result visible to students.
pub const STUDENTS_FILE: &str = "students.json";
/// Name of the file holding the result visible to teachers.
pub const TEACHERS_FILE: &str = "teachers.json";

/// One request to build and test a submission inside a grader image.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Results are posted to `{return_url}/results`.
    pub return_url: String,
    pub docker_image: String,
    /// File name to file content. Written into the submission volume root.
    pub files: BTreeMap<String, String>,
    /// In seconds.
    #[serde(
        default = "default_max_run_time",
        deserialize_with = "whole_number"
    )]
    pub max_run_time: u32,
    /// In megabytes.
    #[serde(default = "default_memory", deserialize_with = "whole_number")]
    pub memory: u64,
    /// Passed back untouched.
    #[serde(default)]
    pub meta_data: Option<Box<RawValue>>,
}

fn default_max_run_time() -> u32 {
    DEFAULT_MAX_RUN_TIME
}

fn default_memory() -> u64 {
    DEFAULT_MEMORY_MB
}

impl Job {
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    /// The metadata as it appeared in the submission, for logging.
    pub fn meta_str(&self) -> &str {
        self.meta_data.as_deref().map_or("null", RawValue::get)
    }
}

pub const JOB_SCHEMA: &str = r#"
{
    "$schema": "http://json-schema.org/draft-07/schema#",
    "type": "object",
    "title": "Test job",
    "required": ["returnUrl", "dockerImage", "files"],
    "properties": {
        "metaData": {
            "description": "Metadata passed back to returnUrl."
        },
        "returnUrl": {
            "type": "string",
            "description": "Result of the run will be submitted to this URL."
        },
        "dockerImage": {
            "type": "string",
            "description": "The image will be used to process the files and collect results."
        },
        "files": {
            "type": "object",
            "minProperties": 1,
            "maxProperties": 10,
            "patternProperties": {
                "^[A-Za-z0-9_\\-\\.]{4,250}$": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": 512000
                }
            },
            "additionalProperties": false
        },
        "maxRunTime": {
            "type": "number",
            "description": "After this many seconds the test will break.",
            "multipleOf": 1.0,
            "minimum": 1,
            "maximum": 1800
        },
        "memory": {
            "type": "number",
            "description": "Maximum memory available to the container, in MB.",
            "multipleOf": 1.0,
            "minimum": 10
        }
    },
    "additionalProperties": false
}
"#;

/// Checks raw submissions against [`JOB_SCHEMA`] and decodes them.
pub struct JobValidator {
    schema: jsonschema::Validator,
}

impl JobValidator {
    pub fn new() -> anyhow::Result<JobValidator> {
        let schema: serde_json::Value = serde_json::from_str(JOB_SCHEMA)?;
        let schema = jsonschema::validator_for(&schema)
            .map_err(|e| anyhow::anyhow!("Cannot load json schema: {}", e))?;
        Ok(JobValidator { schema })
    }

    /// Validate `body` and decode it into a [`Job`], applying defaults.
    pub fn parse(&self, body: &[u8]) -> Result<Job, ValidationErr> {
        let document: serde_json::Value = serde_json::from_slice(body)?;
        if let Err(e) = self.schema.validate(&document) {
            return Err(ValidationErr::Schema(e.to_string()));
        }
        // Decode from the raw bytes again so `metaData` keeps its exact text.
        Ok(serde_json::from_slice(body)?)
    }
}

impl std::fmt::Debug for JobValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobValidator").finish_non_exhaustive()
    }
}
