use std::path::{Path, PathBuf};

use crate::config::schema::JobsConfig;
use crate::error::ConfigError;
use crate::job::request::MAX_TIMEOUT_SECS;

const SCHEMA_JSON: &str = include_str!("../../schema/jobs-config-v1.json");

/// Overrides `basePath`.
pub const ENV_BASE_PATH: &str = "NAS_ANALYZE";
/// Overrides `limits.reloadLimit`.
pub const ENV_RELOAD_LIMIT: &str = "JOB_RELOAD_LIMIT";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<JobsConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<JobsConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: JobsConfig = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads `path` when given, otherwise starts from defaults; then applies
/// environment overrides and re-validates.
pub fn resolve_config(path: Option<&Path>) -> Result<JobsConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => JobsConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

pub fn apply_env_overrides(config: &mut JobsConfig) -> Result<(), ConfigError> {
    if let Ok(base) = std::env::var(ENV_BASE_PATH) {
        let base = base.trim();
        if !base.is_empty() {
            config.base_path = PathBuf::from(base);
        }
    }

    if let Ok(raw) = std::env::var(ENV_RELOAD_LIMIT) {
        let limit = raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::InvalidEnv {
                name: ENV_RELOAD_LIMIT,
                value: raw.clone(),
            })?;
        config.limits.reload_limit = limit;
    }

    Ok(())
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

pub fn validate_config(config: &JobsConfig) -> Result<(), ConfigError> {
    if config.base_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "basePath must not be empty".to_string(),
        });
    }

    if config.pipeline.program.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "pipeline.program must not be empty".to_string(),
        });
    }

    if config.timeouts.job_timeout_secs == 0
        || config.timeouts.job_timeout_secs > MAX_TIMEOUT_SECS
    {
        return Err(ConfigError::Validation {
            message: format!(
                "timeouts.jobTimeoutSecs must be between 1 and {}",
                MAX_TIMEOUT_SECS
            ),
        });
    }

    if config.worker.concurrency == 0 {
        return Err(ConfigError::Validation {
            message: "worker.concurrency must be at least 1".to_string(),
        });
    }

    if config.limits.reload_limit == 0 {
        return Err(ConfigError::Validation {
            message: "limits.reloadLimit must be at least 1".to_string(),
        });
    }

    for key in config.pipeline.env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ConfigError::Validation {
                message: format!("Invalid environment variable name in pipeline.env: '{}'", key),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config = load_config_from_str("{}").unwrap();
        assert_eq!(config, JobsConfig::default());
        assert_eq!(config.limits.stdout_max_bytes, 50_000);
        assert_eq!(config.limits.error_max_bytes, 4_000);
        assert_eq!(config.timeouts.job_timeout_secs, 3600);
        assert_eq!(config.worker.poll_interval_millis, 2000);
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "basePath": "/srv/loans",
            "limits": { "stdoutMaxBytes": 1000, "reloadLimit": 20 },
            "timeouts": { "jobTimeoutSecs": 60, "killGraceSecs": 1 },
            "worker": { "concurrency": 2, "pollIntervalMillis": 250 },
            "pipeline": {
                "program": "/usr/bin/env",
                "args": ["python3", "run.py"],
                "env": { "RUN_MODE": "test" }
            }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/srv/loans"));
        assert_eq!(config.limits.stdout_max_bytes, 1000);
        assert_eq!(config.limits.stderr_max_bytes, 50_000);
        assert_eq!(config.limits.reload_limit, 20);
        assert_eq!(config.timeouts.job_timeout_secs, 60);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.pipeline.args, vec!["python3", "run.py"]);
        assert_eq!(config.pipeline.env.get("RUN_MODE").unwrap(), "test");
    }

    #[test]
    fn test_schema_rejects_unknown_field() {
        let result = load_config_from_str(r#"{ "basePath": "/x", "bogus": 1 }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_schema_rejects_zero_timeout() {
        let result = load_config_from_str(r#"{ "timeouts": { "jobTimeoutSecs": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_invalid_json() {
        let result = load_config_from_str("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_semantic_validation_rejects_bad_env_name() {
        let mut config = JobsConfig::default();
        config
            .pipeline
            .env
            .insert("A=B".to_string(), "x".to_string());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_semantic_validation_rejects_huge_job_timeout() {
        let mut config = JobsConfig::default();
        config.timeouts.job_timeout_secs = u64::MAX;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/jobs.json");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_BASE_PATH, "/tmp/loan-base");
        std::env::set_var(ENV_RELOAD_LIMIT, "7");

        let config = resolve_config(None).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/tmp/loan-base"));
        assert_eq!(config.limits.reload_limit, 7);

        std::env::remove_var(ENV_BASE_PATH);
        std::env::remove_var(ENV_RELOAD_LIMIT);
    }

    #[test]
    #[serial]
    fn test_invalid_reload_limit_env() {
        std::env::set_var(ENV_RELOAD_LIMIT, "lots");

        let result = resolve_config(None);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv {
                name: ENV_RELOAD_LIMIT,
                ..
            })
        ));

        std::env::remove_var(ENV_RELOAD_LIMIT);
    }
}
