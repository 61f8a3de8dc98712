use serde::Deserialize;
use std::env;
use std::time::Duration;

use rideshare_core::search::DEFAULT_SEARCH_RADIUS_KM;
use rideshare_core::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    pub redis_url: Option<String>,
    pub key_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    #[serde(default = "default_cas_attempts")]
    pub max_cas_attempts: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_search_radius")]
    pub default_search_radius_km: f64,
}

fn default_cas_attempts() -> u32 { 5 }
fn default_retry_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 50 }
fn default_max_backoff_ms() -> u64 { 1000 }
fn default_search_radius() -> f64 { DEFAULT_SEARCH_RADIUS_KM }

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_cas_attempts: default_cas_attempts(),
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_initial_backoff_ms(),
            retry_max_backoff_ms: default_max_backoff_ms(),
            default_search_radius_km: default_search_radius(),
        }
    }
}

impl CoordinationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

fn default_feed_capacity() -> usize { crate::memory::DEFAULT_FEED_CAPACITY }

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            feed_capacity: default_feed_capacity(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `RIDESHARE_STORAGE__BACKEND=redis`
            .add_source(config::Environment::with_prefix("RIDESHARE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
