//! Engine configuration

use anyhow::{Context, Result};
use engine_lib::cooldown::CooldownConfig;
use engine_lib::engine::EngineSettings;
use engine_lib::recorder::RecorderConfig;
use engine_lib::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Names a config file layered under the `ENGINE_` environment
pub const CONFIG_FILE_VAR: &str = "ENGINE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Instance name attached to structured logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Predict route of the ML service; rules only when unset
    #[serde(default)]
    pub predictor_url: Option<String>,

    #[serde(default = "default_predictor_timeout_ms")]
    pub predictor_timeout_ms: u64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_record_max_attempts")]
    pub record_max_attempts: u32,

    #[serde(default = "default_device_concurrency")]
    pub device_concurrency: usize,
}

fn default_service_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "actuation-engine".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "postgres://postgres@localhost:5432/fountaine".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_predictor_timeout_ms() -> u64 {
    2000
}

fn default_tick_interval() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    180
}

fn default_record_max_attempts() -> u32 {
    2
}

fn default_device_concurrency() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            api_port: default_api_port(),
            database_url: default_database_url(),
            database_max_connections: default_database_max_connections(),
            predictor_url: None,
            predictor_timeout_ms: default_predictor_timeout_ms(),
            tick_interval_secs: default_tick_interval(),
            cooldown_secs: default_cooldown(),
            record_max_attempts: default_record_max_attempts(),
            device_concurrency: default_device_concurrency(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_VAR) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("ENGINE").try_parsing(true))
            .build()
            .context("Failed to read engine configuration")?;

        let mut loaded: EngineConfig = config
            .try_deserialize()
            .context("Invalid engine configuration")?;
        loaded.predictor_url = loaded.predictor_url.filter(|url| !url.trim().is_empty());
        Ok(loaded)
    }

    pub fn predictor_timeout(&self) -> Duration {
        Duration::from_millis(self.predictor_timeout_ms)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            predictor_timeout: self.predictor_timeout(),
        }
    }

    pub fn cooldown_config(&self) -> CooldownConfig {
        CooldownConfig {
            window: Duration::from_secs(self.cooldown_secs),
            ..CooldownConfig::default()
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            max_attempts: self.record_max_attempts.max(1),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs.max(1)),
            device_concurrency: self.device_concurrency.max(1),
        }
    }
}
