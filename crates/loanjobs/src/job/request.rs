use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::sanitize::is_safe_component;

/// Longest timeout a request may ask for: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Typed view of a job's request map.
///
/// Missing fields take the pipeline's defaults, so two maps that differ only
/// in spelled-out defaults normalize to the same request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub skip_intake: bool,
    pub skip_process: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub offline_embeddings: bool,
    pub top_k: u32,
    pub max_per_file: u32,
    pub max_dropped_chunks: u32,
    pub expect_rp_hash_stable: bool,
    pub smoke_debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_llm: Option<bool>,
    /// Seconds; falls back to the configured job timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            run_id: None,
            skip_intake: false,
            skip_process: false,
            source_path: None,
            offline_embeddings: true,
            top_k: 80,
            max_per_file: 12,
            max_dropped_chunks: 5,
            expect_rp_hash_stable: false,
            smoke_debug: false,
            llm_model: None,
            run_llm: None,
            timeout: None,
            question: None,
            profile: None,
        }
    }
}

impl JobRequest {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ValidationError> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Normalized map form; this is what gets persisted and fingerprinted.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn is_query(&self) -> bool {
        self.question.is_some()
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }

    /// Checks applied by `enqueue` before any record is created.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(run_id) = &self.run_id {
            check_component("run_id", run_id)?;
        }

        if let Some(secs) = self.timeout {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(ValidationError::InvalidTimeout);
            }
        }

        if let Some(question) = &self.question {
            if question.trim().is_empty() {
                return Err(ValidationError::EmptyField("question"));
            }
            if self.run_id.is_none() {
                return Err(ValidationError::MissingRunId("a question is asked"));
            }
        } else if self.profile.is_some() {
            return Err(ValidationError::ProfileWithoutQuestion);
        }

        Ok(())
    }

    /// Argument rules of the loan pipeline itself; enforced by submission
    /// surfaces, not by the job core.
    pub fn check_pipeline_contract(&self) -> Result<(), ValidationError> {
        if self.is_query() {
            return Ok(());
        }

        if !self.skip_intake
            && self
                .source_path
                .as_deref()
                .map_or(true, |p| p.trim().is_empty())
        {
            return Err(ValidationError::MissingSourcePath);
        }

        if self.skip_process && self.run_id.is_none() {
            return Err(ValidationError::MissingRunId("skip_process is true"));
        }

        Ok(())
    }
}

/// Rejects identifiers that cannot be used as one directory name.
pub fn check_component(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if !is_safe_component(value) {
        return Err(ValidationError::UnsafeComponent {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
