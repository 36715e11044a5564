//! Application configuration for the core logic engine.
//!
//! User config lives at `~/.corelogic/corelogic.toml`.
//! Environment variables override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreLogicError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "corelogic.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".corelogic";

/// Environment overrides recognized by [`AppConfig::apply_env_overrides`].
pub const ENV_MIN_KNOWLEDGE_ITEMS: &str = "MIN_KNOWLEDGE_ITEMS";
pub const ENV_DISTILLATION_INTERVAL_HOURS: &str = "DISTILLATION_INTERVAL_HOURS";
pub const ENV_WORKER_POLL_INTERVAL_MS: &str = "WORKER_POLL_INTERVAL_MS";
pub const ENV_MAX_CONCURRENT_JOBS: &str = "MAX_CONCURRENT_JOBS";
pub const ENV_DEFAULT_JOB_PRIORITY: &str = "DEFAULT_JOB_PRIORITY";

// ---------------------------------------------------------------------------
// Config structs (matching corelogic.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Trigger policy and scheduler settings.
    #[serde(default)]
    pub distillation: DistillationConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Distiller provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.corelogic/corelogic.db".into()
}

/// `[distillation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Domains with fewer knowledge items are never distilled.
    #[serde(default = "default_min_knowledge_items")]
    pub min_knowledge_items: usize,

    /// Age of the active version after which a domain is stale.
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Priority given to scheduled jobs.
    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// How often the scheduler re-evaluates every domain.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            min_knowledge_items: default_min_knowledge_items(),
            interval_hours: default_interval_hours(),
            default_priority: default_priority(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_min_knowledge_items() -> usize {
    5
}
fn default_interval_hours() -> u64 {
    24
}
fn default_priority() -> i32 {
    5
}
fn default_check_interval_secs() -> u64 {
    3600
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Milliseconds between claim attempts.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Jobs allowed to process simultaneously in one worker.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Running jobs older than this are assumed abandoned and failed.
    #[serde(default = "default_stale_job_timeout_secs")]
    pub stale_job_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            stale_job_timeout_secs: default_stale_job_timeout_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    30_000
}
fn default_max_concurrent_jobs() -> usize {
    3
}
fn default_stale_job_timeout_secs() -> u64 {
    3600
}

/// `[provider]` section (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Default model for distillation.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_request_timeout_secs() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Derived runtime settings
// ---------------------------------------------------------------------------

impl DistillationConfig {
    /// Staleness interval as a chrono duration.
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.interval_hours as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_job_timeout_secs)
    }
}

impl AppConfig {
    /// Apply the recognized environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(v) = parse_override(&lookup, ENV_MIN_KNOWLEDGE_ITEMS)? {
            self.distillation.min_knowledge_items = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_DISTILLATION_INTERVAL_HOURS)? {
            self.distillation.interval_hours = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_WORKER_POLL_INTERVAL_MS)? {
            self.worker.poll_interval_ms = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_MAX_CONCURRENT_JOBS)? {
            self.worker.max_concurrent_jobs = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_DEFAULT_JOB_PRIORITY)? {
            self.distillation.default_priority = v;
        }
        Ok(())
    }

    /// Reject settings the scheduler or worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.max_concurrent_jobs == 0 {
            return Err(CoreLogicError::config(
                "worker.max_concurrent_jobs must be at least 1",
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(CoreLogicError::config(
                "worker.poll_interval_ms must be greater than 0",
            ));
        }
        if self.worker.stale_job_timeout_secs <= self.provider.request_timeout_secs {
            return Err(CoreLogicError::config(format!(
                "worker.stale_job_timeout_secs ({}) must exceed provider.request_timeout_secs ({})",
                self.worker.stale_job_timeout_secs, self.provider.request_timeout_secs
            )));
        }
        if self.distillation.check_interval_secs == 0 {
            return Err(CoreLogicError::config(
                "distillation.check_interval_secs must be greater than 0",
            ));
        }
        Url::parse(&self.provider.base_url).map_err(|e| {
            CoreLogicError::config(format!(
                "provider.base_url '{}' is not a valid URL: {e}",
                self.provider.base_url
            ))
        })?;
        Ok(())
    }

    /// Resolve `storage.db_path`, expanding a leading `~/`.
    pub fn db_path(&self) -> Result<PathBuf> {
        expand_home(&self.storage.db_path)
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CoreLogicError::config(format!("invalid {key}='{raw}': {e}"))),
        _ => Ok(None),
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CoreLogicError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.corelogic/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CoreLogicError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.corelogic/corelogic.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk, then apply env overrides.
/// Falls back to defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_env_overrides()?;
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CoreLogicError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CoreLogicError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CoreLogicError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CoreLogicError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CoreLogicError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the provider API key env var is set and non-empty, returning it.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.provider.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CoreLogicError::config(format!(
            "distiller API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("min_knowledge_items"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.distillation.min_knowledge_items, 5);
        assert_eq!(config.distillation.interval_hours, 24);
        assert_eq!(config.distillation.default_priority, 5);
        assert_eq!(config.distillation.check_interval_secs, 3600);
        assert_eq!(config.worker.poll_interval_ms, 30_000);
        assert_eq!(config.worker.max_concurrent_jobs, 3);
        assert_eq!(config.worker.stale_job_timeout_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[worker]
max_concurrent_jobs = 8

[provider]
model = "gpt-4o"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.worker.max_concurrent_jobs, 8);
        assert_eq!(config.worker.poll_interval_ms, 30_000);
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.provider.max_tokens, 4000);
        assert_eq!(config.distillation.interval_hours, 24);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MIN_KNOWLEDGE_ITEMS, "10"),
            (ENV_DISTILLATION_INTERVAL_HOURS, "6"),
            (ENV_WORKER_POLL_INTERVAL_MS, "500"),
            (ENV_MAX_CONCURRENT_JOBS, "2"),
            (ENV_DEFAULT_JOB_PRIORITY, "9"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .expect("apply overrides");
        assert_eq!(config.distillation.min_knowledge_items, 10);
        assert_eq!(config.distillation.interval(), chrono::Duration::hours(6));
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.worker.max_concurrent_jobs, 2);
        assert_eq!(config.distillation.default_priority, 9);
    }

    #[test]
    fn bad_override_is_a_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == ENV_MAX_CONCURRENT_JOBS).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, CoreLogicError::Config { .. }));
        assert!(err.to_string().contains("MAX_CONCURRENT_JOBS"));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.worker.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.provider.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_stale_timeout_within_request_timeout() {
        let mut config = AppConfig::default();
        config.worker.stale_job_timeout_secs = config.provider.request_timeout_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_job_timeout_secs"));
    }

    #[test]
    fn db_path_expands_home() {
        let mut config = AppConfig::default();
        config.storage.db_path = "/tmp/corelogic.db".into();
        assert_eq!(config.db_path().unwrap(), PathBuf::from("/tmp/corelogic.db"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Unique env var name so tests don't interfere with each other
        config.provider.api_key_env = "CL_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
