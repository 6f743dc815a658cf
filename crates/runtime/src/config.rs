//! Configuration management for the analytics runtime
//!
//! Every tunable defaults in code and can be overridden from the
//! environment (`DATALYST_*` variables) or seeded from a TOML file.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Which LLM provider the wrapper should prefer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChoice {
    /// Let the selection policy decide (remote if credentialed, else local).
    #[default]
    Auto,
    Local,
    Remote,
}

impl std::str::FromStr for ProviderChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProviderChoice::Auto),
            "local" => Ok(ProviderChoice::Local),
            "remote" => Ok(ProviderChoice::Remote),
            other => Err(ConfigError::InvalidValue {
                key: "DATALYST_LLM_PROVIDER".to_string(),
                reason: format!("unknown provider '{}'", other),
            }),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub vector: VectorConfig,
    pub sessions: SessionConfig,
    pub accounting: AccountingConfig,
    pub maintenance: MaintenanceConfig,
    pub audit: AuditConfig,
    pub storage: StorageConfig,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8780,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// LLM wrapper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderChoice,
    /// Local provider endpoint (Ollama-style API).
    pub local_url: String,
    pub local_model: String,
    /// Remote provider endpoint and credentials.
    pub remote_url: String,
    pub remote_model: String,
    #[serde(skip_serializing)]
    pub remote_api_key: Option<String>,
    /// Most recent chat turns included in prompt assembly.
    pub max_context_messages: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Cost per 1000 input tokens, in micro-dollars.
    pub input_token_cost: f64,
    /// Cost per 1000 output tokens, in micro-dollars.
    pub output_token_cost: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderChoice::Auto,
            local_url: "http://127.0.0.1:11434".to_string(),
            local_model: "llama3.1".to_string(),
            remote_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            remote_model: "gemini-2.0-flash".to_string(),
            remote_api_key: None,
            max_context_messages: 10,
            request_timeout: Duration::from_secs(120),
            input_token_cost: 75.0,
            output_token_cost: 300.0,
        }
    }
}

/// Sandbox executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter used for analysis code.
    pub interpreter: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_memory_mb: u64,
    pub max_output_bytes: u64,
    /// Concurrent executions allowed.
    pub pool_size: usize,
    /// Root under which per-execution work dirs are created.
    pub work_root: PathBuf,
    /// Supervisor polling cadence; never raised above 100 ms.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            timeout: Duration::from_secs(30),
            max_memory_mb: 512,
            max_output_bytes: 1024 * 1024,
            pool_size: 4,
            work_root: env::temp_dir().join("datalyst-sandbox"),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Key prefix in the backing key-value store.
    pub key_prefix: String,
    pub dimension: usize,
    pub max_dimension: usize,
    pub default_top_k: usize,
    pub similarity_threshold: f32,
    /// Record TTL, refreshed on access.
    #[serde(with = "humantime_serde")]
    pub note_ttl: Duration,
    /// Embedding endpoint; unset falls back to the deterministic
    /// byte-derived embedder.
    pub embedding_url: Option<String>,
    pub embedding_model: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "datalyst:rag".to_string(),
            dimension: 384,
            max_dimension: 384,
            default_top_k: 5,
            similarity_threshold: 0.7,
            note_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            embedding_url: None,
            embedding_model: "all-minilm".to_string(),
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions_per_user: usize,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 10,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Token accounting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Default monthly quota assigned to new users.
    pub monthly_quota_tokens: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            monthly_quota_tokens: 1_000_000,
        }
    }
}

/// Maintenance supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Fraction of system memory above which the cache is purged.
    pub memory_purge_threshold: f64,
    /// Fraction of system memory above which an allocator reclamation
    /// pass is forced.
    pub memory_reclaim_threshold: f64,
    /// Fraction of disk usage above which cleanup runs immediately.
    pub disk_cleanup_threshold: f64,
    /// Sessions idle longer than this are deleted.
    pub session_max_idle_days: u32,
    /// Vector notes older than this are deleted.
    pub note_max_age_days: u32,
    /// Generated images older than this are deleted.
    pub image_max_age_days: u32,
    /// Sandbox execution records older than this are deleted.
    pub execution_max_age_days: u32,
    /// Ceiling on total cached bytes before the cache is cleared.
    pub cache_max_bytes: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(30 * 60),
            memory_purge_threshold: 0.80,
            memory_reclaim_threshold: 0.85,
            disk_cleanup_threshold: 0.90,
            session_max_idle_days: 30,
            note_max_age_days: 30,
            image_max_age_days: 14,
            execution_max_age_days: 7,
            cache_max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub retention_days: u32,
    /// Keys whose values are masked before persistence.
    pub sensitive_fields: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 365,
            sensitive_fields: vec![
                "password".to_string(),
                "token".to_string(),
                "key".to_string(),
                "secret".to_string(),
                "email".to_string(),
                "phone".to_string(),
            ],
        }
    }
}

/// Blob / media storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the blob store (datasets, images, reports).
    pub media_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("./media"),
        }
    }
}

impl Config {
    /// Load configuration from the environment, optionally seeded from a
    /// TOML file named by `DATALYST_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = if let Ok(path) = env::var("DATALYST_CONFIG") {
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
                message: format!("{}: {}", path, e),
            })?;
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("DATALYST_API_HOST") {
            self.api.host = v;
        }
        if let Ok(v) = env::var("DATALYST_API_PORT") {
            self.api.port = parse_env("DATALYST_API_PORT", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_LLM_PROVIDER") {
            self.llm.provider = v.parse()?;
        }
        if let Ok(v) = env::var("DATALYST_LOCAL_LLM_URL") {
            self.llm.local_url = v;
        }
        if let Ok(v) = env::var("DATALYST_LOCAL_LLM_MODEL") {
            self.llm.local_model = v;
        }
        if let Ok(v) = env::var("DATALYST_REMOTE_LLM_URL") {
            self.llm.remote_url = v;
        }
        if let Ok(v) = env::var("DATALYST_REMOTE_LLM_MODEL") {
            self.llm.remote_model = v;
        }
        if let Ok(v) = env::var("DATALYST_REMOTE_LLM_API_KEY") {
            if !v.is_empty() {
                self.llm.remote_api_key = Some(v);
            }
        }
        if let Ok(v) = env::var("DATALYST_SANDBOX_TIMEOUT_SECS") {
            self.sandbox.timeout = Duration::from_secs(parse_env("DATALYST_SANDBOX_TIMEOUT_SECS", &v)?);
        }
        if let Ok(v) = env::var("DATALYST_SANDBOX_MAX_MEMORY_MB") {
            self.sandbox.max_memory_mb = parse_env("DATALYST_SANDBOX_MAX_MEMORY_MB", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_SANDBOX_POOL_SIZE") {
            self.sandbox.pool_size = parse_env("DATALYST_SANDBOX_POOL_SIZE", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_MONTHLY_QUOTA_TOKENS") {
            self.accounting.monthly_quota_tokens =
                parse_env("DATALYST_MONTHLY_QUOTA_TOKENS", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_MAX_SESSIONS_PER_USER") {
            self.sessions.max_sessions_per_user =
                parse_env("DATALYST_MAX_SESSIONS_PER_USER", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_RAG_TOP_K") {
            self.vector.default_top_k = parse_env("DATALYST_RAG_TOP_K", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_RAG_THRESHOLD") {
            self.vector.similarity_threshold = parse_env("DATALYST_RAG_THRESHOLD", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_EMBEDDING_URL") {
            if !v.is_empty() {
                self.vector.embedding_url = Some(v);
            }
        }
        if let Ok(v) = env::var("DATALYST_EMBEDDING_MODEL") {
            self.vector.embedding_model = v;
        }
        if let Ok(v) = env::var("DATALYST_CLEANUP_INTERVAL_SECS") {
            self.maintenance.cleanup_interval =
                Duration::from_secs(parse_env("DATALYST_CLEANUP_INTERVAL_SECS", &v)?);
        }
        if let Ok(v) = env::var("DATALYST_AUDIT_RETENTION_DAYS") {
            self.audit.retention_days = parse_env("DATALYST_AUDIT_RETENTION_DAYS", &v)?;
        }
        if let Ok(v) = env::var("DATALYST_MEDIA_ROOT") {
            self.storage.media_root = PathBuf::from(v);
        }
        Ok(())
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vector.dimension == 0 || self.vector.dimension > self.vector.max_dimension {
            return Err(ConfigError::InvalidValue {
                key: "vector.dimension".to_string(),
                reason: format!(
                    "must be in 1..={}, got {}",
                    self.vector.max_dimension, self.vector.dimension
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.vector.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "vector.similarity_threshold".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.sandbox.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.pool_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sandbox.poll_interval > Duration::from_millis(100) {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.poll_interval".to_string(),
                reason: "supervision cadence must not exceed 100ms".to_string(),
            });
        }
        if self.sessions.max_sessions_per_user == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sessions.max_sessions_per_user".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("{}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vector.dimension, 384);
        assert_eq!(config.sandbox.max_memory_mb, 512);
        assert_eq!(config.sandbox.timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_oversized_dimension() {
        let mut config = Config::default();
        config.vector.dimension = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_slow_sandbox_polling() {
        let mut config = Config::default();
        config.sandbox.poll_interval = Duration::from_millis(250);
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_choice_parses() {
        assert_eq!("remote".parse::<ProviderChoice>().ok(), Some(ProviderChoice::Remote));
        assert!("carrier-pigeon".parse::<ProviderChoice>().is_err());
    }

    // Environment mutation is process-global; serialize these.
    #[test]
    #[serial_test::serial]
    fn env_overrides_apply() {
        std::env::set_var("DATALYST_SANDBOX_MAX_MEMORY_MB", "128");
        std::env::set_var("DATALYST_RAG_TOP_K", "9");
        let config = Config::from_env().unwrap();
        std::env::remove_var("DATALYST_SANDBOX_MAX_MEMORY_MB");
        std::env::remove_var("DATALYST_RAG_TOP_K");
        assert_eq!(config.sandbox.max_memory_mb, 128);
        assert_eq!(config.vector.default_top_k, 9);
    }

    #[test]
    #[serial_test::serial]
    fn invalid_env_value_is_a_config_error() {
        std::env::set_var("DATALYST_API_PORT", "not-a-port");
        let result = Config::from_env();
        std::env::remove_var("DATALYST_API_PORT");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
