pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, load_config, load_config_from_str, resolve_config, validate_config,
    ENV_BASE_PATH, ENV_RELOAD_LIMIT,
};
pub use schema::{
    JobsConfig, LimitsConfig, PipelineSettings, TimeoutsConfig, WorkerConfig, DEFAULT_BASE_PATH,
};
