//! Config-file errors, live-setting warnings and the cross-key checks run on
//! every settings snapshot.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Serialize;
use thiserror::Error;

use crate::config::settings::{
    KEY_BREAKER_WINDOW, KEY_RETENTION_AGGREGATES, KEY_RING_CAPACITY, Settings,
};
use crate::storage::Mode;

/// Errors raised while loading the YAML config. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    ValidationError(String),
}

/// Non-fatal configuration finding. Logged, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigWarning {
    /// Setting key the warning is about, if it concerns a single key.
    pub key: Option<String>,
    pub message: String,
}

impl ConfigWarning {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{key}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Human duration such as `250ms`, `90s`, `15m` or `7d`. A bare number has no
/// unit and is rejected.
///
/// ```
/// use ringwarden::config::parse_duration;
///
/// assert_eq!(parse_duration(" 2m ").unwrap().as_secs(), 120);
/// assert!(parse_duration("120").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    match s.trim() {
        "" => Err("empty duration".to_string()),
        trimmed => humantime::parse_duration(trimmed).map_err(|e| format!("'{trimmed}': {e}")),
    }
}

static ENV_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{(?P<name>[A-Za-z_]\w*)(?::-(?P<fallback>[^}]*))?\}").ok());

/// Substitute `${NAME}` and `${NAME:-fallback}` with the environment's value.
/// Unset variables without a fallback become empty.
pub fn expand_env_vars(input: &str) -> String {
    let Some(re) = ENV_REF.as_ref() else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &Captures| {
        std::env::var(&caps["name"]).unwrap_or_else(|_| {
            caps.name("fallback")
                .map_or_else(String::new, |m| m.as_str().to_string())
        })
    })
    .into_owned()
}

/// Minimum ring capacity that keeps up with flushing for one mode profile:
/// `ceil(flush_interval / sample_interval * safety_factor)`.
pub fn required_capacity(flush: Duration, sample: Duration, safety_factor: f64) -> u64 {
    if sample.is_zero() {
        return u64::MAX;
    }
    let ratio = flush.as_secs_f64() / sample.as_secs_f64();
    (ratio * safety_factor).ceil() as u64
}

/// Cross-key checks on a settings snapshot.
///
/// The ring must hold at least one flush interval worth of samples (times the
/// safety factor) in every mode, otherwise samples are overwritten before
/// they are rolled up.
pub fn validate_settings(settings: &Settings) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    for mode in [Mode::Normal, Mode::Light, Mode::Emergency] {
        let profile = settings.profile(mode);
        let required = required_capacity(
            profile.flush_interval,
            profile.sample_interval,
            settings.flush_safety_factor,
        );
        if u64::from(settings.ring_capacity) < required {
            warnings.push(ConfigWarning::new(
                KEY_RING_CAPACITY,
                format!(
                    "capacity {} is below {} required in {} mode (flush every {}, sample every {}, safety factor {}); samples will be overwritten before flush",
                    settings.ring_capacity,
                    required,
                    mode,
                    humantime::format_duration(profile.flush_interval),
                    humantime::format_duration(profile.sample_interval),
                    settings.flush_safety_factor,
                ),
            ));
        }
    }

    if settings.retention.aggregates < settings.aggregate_bucket {
        warnings.push(ConfigWarning::new(
            KEY_RETENTION_AGGREGATES,
            "aggregate retention is shorter than one bucket",
        ));
    }

    if settings.breaker.window < settings.breaker.threshold {
        warnings.push(ConfigWarning::new(
            KEY_BREAKER_WINDOW,
            "breaker window is shorter than the duration threshold",
        ));
    }

    warnings
}
