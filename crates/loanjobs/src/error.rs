use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoanJobsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Job not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Rejections raised before any job record is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("{field} '{value}' is not a single safe path component")]
    UnsafeComponent { field: &'static str, value: String },

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("source_path is required when skip_intake is false")]
    MissingSourcePath,

    #[error("run_id is required when {0}")]
    MissingRunId(&'static str),

    #[error(
        "timeout must be between 1 and {} seconds",
        crate::job::request::MAX_TIMEOUT_SECS
    )]
    InvalidTimeout,

    #[error("profile requires a question")]
    ProfileWithoutQuestion,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove file '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode JSON: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Corrupt record '{path}': {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Idempotency key {key} is contended; gave up after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Loan {tenant_id}/{loan_id} is busy; waited {waited:?}")]
    Timeout {
        tenant_id: String,
        loan_id: String,
        waited: Duration,
    },

    #[error("Loan lock file error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Output capture failed for '{path}': {source}")]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for pipeline process: {0}")]
    Wait(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LoanJobsError>;
