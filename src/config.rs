use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::engine::{EngineConfig, RetryPolicy};
use crate::models::MatchingPolicy;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub store: StoreSettings,
    pub identity: IdentitySettings,
    #[serde(default)]
    pub matching: MatchingSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
}

/// Which backing store the service runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { backend: default_backend() }
    }
}

fn default_backend() -> StoreBackend { StoreBackend::Postgres }

#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySettings {
    pub jwt_secret: String,
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingSettings {
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            cooldown_hours: default_cooldown_hours(),
            max_candidates: default_max_candidates(),
        }
    }
}

fn default_cooldown_hours() -> u64 { 24 }
fn default_max_candidates() -> usize { 50 }

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: u64,
    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            flush_interval_secs: default_flush_interval_secs(),
            dedupe_capacity: default_dedupe_capacity(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
        }
    }
}

impl SyncSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

fn default_max_attempts() -> u32 { 5 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 5000 }
fn default_flush_interval_secs() -> u64 { 5 }
fn default_dedupe_capacity() -> u64 { 100_000 }
fn default_dedupe_ttl_secs() -> u64 { 86_400 }

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Settings {
    /// Load configuration from file and environment variables
    ///
    /// Configuration is loaded in the following order (later overrides earlier):
    /// 1. Configuration file (config/default.toml)
    /// 2. Local overrides (config/local.toml)
    /// 3. Environment variables (prefixed with SKILLSWAP__)
    /// 4. DATABASE_URL, when set
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g., SKILLSWAP__SERVER__PORT -> server.port
            .add_source(env_source())
            .build()?;

        with_database_url(settings)?.try_deserialize()
    }

    /// Load configuration from a custom path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(env_source())
            .build()?;

        with_database_url(settings)?.try_deserialize()
    }

    /// Parse a TOML document, without consulting the environment
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn matching_policy(&self) -> MatchingPolicy {
        MatchingPolicy {
            cooldown: Duration::from_secs(self.matching.cooldown_hours.saturating_mul(3600)),
            max_candidates: self.matching.max_candidates,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.sync.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.sync.max_backoff_ms),
        }
    }
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        EngineConfig {
            matching: settings.matching_policy(),
            retry: settings.retry_policy(),
            dedupe_capacity: settings.sync.dedupe_capacity,
            dedupe_ttl: Duration::from_secs(settings.sync.dedupe_ttl_secs),
        }
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("SKILLSWAP")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// `DATABASE_URL` wins over every file and prefixed variable
fn with_database_url(settings: Config) -> Result<Config, ConfigError> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => Config::builder()
            .add_source(settings)
            .set_override("database.url", url)?
            .build(),
        Err(_) => Ok(settings),
    }
}
