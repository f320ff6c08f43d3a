//! Server configuration

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

use accord_db::DatabaseConfig;
use accord_provisioning::{EngineSettings, RetryPolicy, WorkerConfig};

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub security: SecuritySettings,
    pub engine: EngineSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Deserialize)]
pub struct SecuritySettings {
    /// Base64-encoded 32-byte AES-256-GCM key for connector credentials
    pub encryption_key: String,
}

impl std::fmt::Debug for SecuritySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySettings")
            .field("encryption_key", &"<redacted>")
            .finish()
    }
}

/// Engine and worker tunables
#[derive(Debug, Deserialize)]
pub struct EngineSection {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub concurrency: usize,
    pub default_max_retries: u32,
    pub operation_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub stale_release_interval_secs: u64,
    pub stale_after_secs: u64,
}

impl EngineSection {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_max_retries: self.default_max_retries,
            operation_timeout: self.operation_timeout(),
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            retry: RetryPolicy::new(self.backoff_base_secs, self.backoff_max_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval_ms: self.poll_interval_ms,
            stale_release_interval_secs: self.stale_release_interval_secs,
            stale_after_secs: self.stale_after_secs,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_check_timeout() -> u64 {
    5000
}

fn default_max_connections() -> u32 {
    10
}

impl Settings {
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.health_check_timeout_ms", 5000)?
            .set_default("database.max_connections", 10)?
            .set_default("engine.poll_interval_ms", 1000)?
            .set_default("engine.batch_size", 50)?
            .set_default("engine.concurrency", 4)?
            .set_default("engine.default_max_retries", 3)?
            .set_default("engine.operation_timeout_secs", 30)?
            .set_default("engine.backoff_base_secs", 60)?
            .set_default("engine.backoff_max_secs", 3600)?
            .set_default("engine.stale_release_interval_secs", 60)?
            .set_default("engine.stale_after_secs", 300)?
            // Load from config file if present
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            // Load from environment variables with ACCORD__ prefix
            .add_source(
                config::Environment::with_prefix("ACCORD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings
            .engine
            .worker_config()
            .validate(settings.engine.operation_timeout())?;

        Ok(settings)
    }
}

impl DatabaseSettings {
    pub fn pool_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            min_connections: 2,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}
