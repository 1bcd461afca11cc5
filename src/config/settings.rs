use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::QuotaError;
use crate::plans::QuotaDef;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Per-plan overrides of the built-in catalog, keyed by plan name.
    #[serde(default)]
    pub plans: HashMap<String, PlanConfig>,
    /// Payment-provider product id to plan name, used by lifecycle events.
    #[serde(default)]
    pub products: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub pg_url: Option<String>,
    #[serde(default)]
    pub pg_schema: Option<String>,
    #[serde(default)]
    pub pg_pool_size: Option<usize>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_database_path() -> String {
    "data/quota.db".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pg_url: None,
            pg_schema: None,
            pg_pool_size: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// How `commit` guards the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Increment only while `usage_count < limit`, in the same statement.
    #[default]
    Strict,
    /// Check, then unconditional increment. May overshoot under contention.
    Soft,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub enforcement: Enforcement,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Run the expiry sweep in-process at this interval. Unset leaves it to an external scheduler.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub price: f64,
    #[serde(default)]
    pub features: HashMap<String, QuotaDef>,
}

impl Settings {
    pub fn load() -> Result<Self, QuotaError> {
        let _ = dotenvy::dotenv();

        let mut settings = match Self::find_config_file() {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                let parsed = Self::from_toml(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                parsed
            }
            None => {
                tracing::warn!("No configuration file found, using defaults");
                Settings::default()
            }
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, QuotaError> {
        toml::from_str(content).map_err(|e| QuotaError::Config(e.to_string()))
    }

    fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), QuotaError> {
        if let Some(url) = lookup("QUOTA_PG_URL").filter(|s| !s.is_empty()) {
            self.storage.pg_url = Some(url);
        }
        if let Some(path) = lookup("QUOTA_DATABASE_PATH").filter(|s| !s.is_empty()) {
            self.storage.database_path = path;
        }
        if let Some(port) = lookup("QUOTA_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| QuotaError::Config(format!("invalid QUOTA_PORT: {port}")))?;
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_names = ["quota-engine.toml", "config.toml"];

        possible_names
            .iter()
            .find(|name| Path::new(name).exists())
            .map(|name| name.to_string())
    }
}
