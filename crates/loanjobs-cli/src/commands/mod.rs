pub mod jobs;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use loanjobs::config::validate_config;
use loanjobs::{resolve_config, JobService, JobsConfig, ProcessGroupRunner};
use log::info;

pub fn load_config(path: Option<&Path>, base_path: Option<&Path>) -> Result<JobsConfig> {
    let mut config = resolve_config(path).context("failed to load configuration")?;

    if let Some(base) = base_path {
        config.base_path = base.to_path_buf();
        validate_config(&config).context("invalid base path")?;
    }

    info!("Using base path {}", config.base_path.display());
    Ok(config)
}

pub fn build_service(config: JobsConfig) -> JobService {
    let runner = Arc::new(ProcessGroupRunner::new(&config));
    JobService::new(config, runner)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{}", text);
    Ok(())
}
