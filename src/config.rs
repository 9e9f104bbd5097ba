//! Configuration
//!
//! Two layers:
//!
//! - [`AppConfig`]: static YAML file read at startup (server, database,
//!   probe definitions, setting seeds, schedules)
//! - [`SettingsReader`]: live key/value tunables read fresh on every
//!   evaluation, with typed getters and explicit defaults ([`Settings`])
//!
//! Invalid live values never fail a tick; they fall back to the last good
//! value or the default and are reported as [`ConfigWarning`]s.

mod app;
mod settings;
mod validation;

pub use app::{
    AppConfig, DEFAULT_DB_PATH, DEFAULT_POOL_SIZE, DatabaseConfig, LoadConfig, ServerConfig,
};
pub use settings::{
    BreakerSettings, LoadShedSettings, ModeProfile, ModeSettings, RetentionSettings, Settings,
    SettingsReader, ThrottleSettings, kind_enabled_key,
};
pub use validation::{
    ConfigError, ConfigWarning, expand_env_vars, parse_duration, required_capacity,
    validate_settings,
};
