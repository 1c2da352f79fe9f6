use std::path::Path;

use anyhow::{bail, Context, Result};
use loanjobs::worker::HeartbeatStatus;
use loanjobs::{JobRequest, JobStatus, JobsConfig};
use serde_json::{json, Map, Value};

use super::{build_service, print_json};

fn read_request(inline: Option<&str>, file: Option<&Path>) -> Result<Map<String, Value>> {
    let text = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request file {}", path.display()))?,
        (None, None) => "{}".to_string(),
    };

    match serde_json::from_str::<Value>(&text).context("request is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("request must be a JSON object, got {}", other),
    }
}

pub fn enqueue(
    config: JobsConfig,
    tenant_id: &str,
    loan_id: &str,
    inline: Option<&str>,
    file: Option<&Path>,
) -> Result<()> {
    let request = read_request(inline, file)?;

    // Full pipeline runs need inputs the queue itself does not check.
    JobRequest::from_map(&request)?.check_pipeline_contract()?;

    let service = build_service(config);
    let response = service.enqueue(tenant_id, loan_id, &request)?;
    print_json(&response)
}

pub fn get(config: JobsConfig, job_id: &str) -> Result<()> {
    let service = build_service(config);
    let view = service.get(job_id)?;
    print_json(&view)
}

pub fn list(config: JobsConfig, limit: Option<usize>, status: Option<JobStatus>) -> Result<()> {
    let service = build_service(config);
    let jobs = service.list(limit, status);
    print_json(&jobs)
}

pub fn heartbeat(config: JobsConfig) -> Result<()> {
    let max_age = config.worker.heartbeat_max_age();
    let service = build_service(config);
    let heartbeat = service.heartbeat();

    let (state, age_secs) = match heartbeat.check(max_age) {
        HeartbeatStatus::Missing => ("missing", None),
        HeartbeatStatus::Stale { age } => ("stale", Some(age.as_secs())),
        HeartbeatStatus::Fresh { age } => ("fresh", Some(age.as_secs())),
    };

    print_json(&json!({
        "status": state,
        "age_secs": age_secs,
        "max_age_secs": max_age.as_secs(),
        "record": heartbeat.read(),
        "path": heartbeat.path(),
    }))
}
