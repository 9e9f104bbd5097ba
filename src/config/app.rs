//! The YAML config file: server, database, probes, setting seeds and job
//! cadence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::probe::{TcpProbe, TcpProbeConfig};
use crate::scheduler::SchedulesConfig;
use crate::state::StateService;
use crate::storage::StorageError;

use super::settings::Settings;
use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Connections opened when the file does not say.
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// Default database file.
pub const DEFAULT_DB_PATH: &str = "ringwarden.db";

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_procfs_root() -> String {
    "/proc".to_string()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to listen on.
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Connection pool size (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Host load source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// procfs mount to read load from (default: "/proc").
    #[serde(default = "default_procfs_root")]
    pub procfs_root: String,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            procfs_root: default_procfs_root(),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Parsed config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Web server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// TCP probe definitions grouped by collection kind.
    #[serde(default)]
    pub probes: BTreeMap<String, Vec<TcpProbeConfig>>,

    /// Initial live settings, written only where the store has no value yet.
    #[serde(default)]
    pub settings: BTreeMap<String, serde_yaml::Value>,

    /// Trigger cadence of the scheduled entry points.
    #[serde(default)]
    pub schedules: SchedulesConfig,

    #[serde(default)]
    pub load: LoadConfig,
}

impl AppConfig {
    /// Read, expand and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config file for values that cannot work. Live settings are
    /// checked with the same parser the store uses at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<IpAddr>().is_err() {
            return Err(invalid(format!("server.bind '{}' is not an IP address", self.server.bind)));
        }
        if self.server.port == 0 {
            return Err(invalid("server.port cannot be 0"));
        }
        if self.database.pool_size == 0 {
            return Err(invalid("database.pool_size must be at least 1"));
        }
        self.validate_probes()?;

        let (_, warnings, _) = Settings::parse(&self.setting_seeds()?, &HashMap::new());
        if let Some(w) = warnings.first() {
            return Err(invalid(format!("settings.{w}")));
        }

        self.schedules.validate()
    }

    /// Probe names are global; enabled probes need at least one target.
    fn validate_probes(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (kind, probes) in &self.probes {
            if kind.is_empty() {
                return Err(invalid("probes: empty kind"));
            }
            for probe in probes {
                if probe.name.is_empty() {
                    return Err(invalid(format!("probes.{kind}: probe without a name")));
                }
                if !names.insert(probe.name.as_str()) {
                    return Err(invalid(format!("duplicate probe name '{}'", probe.name)));
                }
                if probe.enabled && probe.targets.is_empty() {
                    return Err(invalid(format!("probes.{kind}.{}: no targets", probe.name)));
                }
            }
        }
        Ok(())
    }

    /// Setting seeds as the string map the store holds.
    pub fn setting_seeds(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.settings
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    other => {
                        return Err(ConfigError::ValidationError(format!(
                            "settings.{key}: expected a scalar, got {other:?}"
                        )));
                    }
                };
                Ok((key.clone(), value))
            })
            .collect()
    }

    /// Write setting seeds the store does not have yet. Returns how many were
    /// inserted; operator changes made at runtime are never overwritten.
    pub fn seed_settings(&self, state: &dyn StateService) -> Result<usize, ConfigError> {
        let mut inserted = 0;
        for (key, value) in self.setting_seeds()? {
            let fresh = state
                .seed_setting(&key, &value)
                .map_err(|e: StorageError| ConfigError::ValidationError(e.to_string()))?;
            if fresh {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Enabled probes, ready to register.
    pub fn build_probes(&self) -> Vec<TcpProbe> {
        self.probes
            .iter()
            .flat_map(|(kind, probes)| {
                probes
                    .iter()
                    .filter(|p| p.enabled)
                    .map(move |p| TcpProbe::new(kind.clone(), p.clone()))
            })
            .collect()
    }
}
