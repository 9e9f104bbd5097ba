//! Live tunables.
//!
//! Settings are stored as a key→string map in the state service and parsed
//! into a typed [`Settings`] snapshot on every evaluation, so an operator
//! change takes effect on the very next tick. A value that fails to parse (or
//! is out of range) falls back to the last value that did parse for that key,
//! or to the built-in default, and produces a [`ConfigWarning`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::config::validation::{ConfigWarning, parse_duration, validate_settings};
use crate::ring::{MAX_CAPACITY, MIN_CAPACITY};
use crate::state::StateService;
use crate::storage::{Mode, StorageError};

// =============================================================================
// Keys
// =============================================================================

pub const KEY_ENABLED: &str = "enabled";
pub const KEY_RING_CAPACITY: &str = "ring.capacity";
pub const KEY_RING_MAX_DETAILS: &str = "ring.max_details";
pub const KEY_FLUSH_SAFETY_FACTOR: &str = "flush.safety_factor";
pub const KEY_AGGREGATE_BUCKET: &str = "aggregate.bucket";
pub const KEY_ARCHIVE_EVERY_N: &str = "archive.every_n";
pub const KEY_RETENTION_AGGREGATES: &str = "retention.aggregates";
pub const KEY_RETENTION_ARCHIVE: &str = "retention.archive";
pub const KEY_RETENTION_LEDGER: &str = "retention.ledger";
pub const KEY_LOAD_SHEDDING_ENABLED: &str = "load_shedding.enabled";
pub const KEY_LOAD_SHEDDING_THRESHOLD: &str = "load_shedding.threshold_pct";
pub const KEY_LOAD_THROTTLE_ENABLED: &str = "load_throttle.enabled";
pub const KEY_LOAD_THROTTLE_THRESHOLD: &str = "load_throttle.threshold";
pub const KEY_BREAKER_ENABLED: &str = "breaker.enabled";
pub const KEY_BREAKER_THRESHOLD: &str = "breaker.threshold";
pub const KEY_BREAKER_WINDOW: &str = "breaker.window";
pub const KEY_BREAKER_MIN_SAMPLES: &str = "breaker.min_samples";
pub const KEY_BREAKER_SMOOTHING: &str = "breaker.smoothing";
pub const KEY_MODE_AUTO: &str = "mode.auto";
pub const KEY_MODE_LIGHT_THRESHOLD: &str = "mode.light_threshold_pct";
pub const KEY_MODE_EMERGENCY_TRIPS: &str = "mode.emergency_trips";
pub const KEY_MODE_TRIP_WINDOW: &str = "mode.trip_window";
pub const KEY_MODE_MIN_DWELL: &str = "mode.min_dwell";
pub const KEY_MODE_ESCALATE_AFTER: &str = "mode.escalate_after";
pub const KEY_MODE_RECOVER_AFTER: &str = "mode.recover_after";
pub const KEY_PROBE_TIMEOUT: &str = "probe.timeout";
pub const KEY_TICK_DEADLINE: &str = "tick.deadline";
pub const KEY_HEALTH_STALE_AFTER: &str = "health.stale_after";

const KIND_PREFIX: &str = "collection.";
const KIND_ENABLED_SUFFIX: &str = ".enabled";

/// Per-kind enable switch key: `collection.<kind>.enabled`.
pub fn kind_enabled_key(kind: &str) -> String {
    format!("{KIND_PREFIX}{kind}{KIND_ENABLED_SUFFIX}")
}

// =============================================================================
// Typed snapshot
// =============================================================================

/// Cadence and query window for one operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeProfile {
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Default time range for real-time reads served from the ring.
    #[serde(with = "humantime_serde")]
    pub realtime_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionSettings {
    #[serde(with = "humantime_serde")]
    pub aggregates: Duration,
    #[serde(with = "humantime_serde")]
    pub archive: Duration,
    #[serde(with = "humantime_serde")]
    pub ledger: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadShedSettings {
    pub enabled: bool,
    pub threshold_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThrottleSettings {
    pub enabled: bool,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerSettings {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub min_samples: u32,
    /// Weight of the newest sample in the moving average, in `(0, 1]`.
    pub smoothing: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModeSettings {
    pub auto: bool,
    pub light_threshold_pct: f64,
    pub emergency_trips: u32,
    #[serde(with = "humantime_serde")]
    pub trip_window: Duration,
    #[serde(with = "humantime_serde")]
    pub min_dwell: Duration,
    pub escalate_after: u32,
    pub recover_after: u32,
}

/// Parsed settings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub enabled: bool,
    pub disabled_kinds: BTreeSet<String>,
    pub ring_capacity: u32,
    pub ring_max_details: u32,
    pub normal: ModeProfile,
    pub light: ModeProfile,
    pub emergency: ModeProfile,
    pub flush_safety_factor: f64,
    #[serde(with = "humantime_serde")]
    pub aggregate_bucket: Duration,
    pub archive_every_n: u64,
    pub retention: RetentionSettings,
    pub load_shedding: LoadShedSettings,
    pub load_throttle: ThrottleSettings,
    pub breaker: BreakerSettings,
    pub mode: ModeSettings,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tick_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_kinds: BTreeSet::new(),
            ring_capacity: 120,
            ring_max_details: 20,
            normal: ModeProfile {
                sample_interval: Duration::from_secs(60),
                flush_interval: Duration::from_secs(5 * MINUTE),
                realtime_window: Duration::from_secs(10 * MINUTE),
            },
            light: ModeProfile {
                sample_interval: Duration::from_secs(120),
                flush_interval: Duration::from_secs(10 * MINUTE),
                realtime_window: Duration::from_secs(30 * MINUTE),
            },
            emergency: ModeProfile {
                sample_interval: Duration::from_secs(300),
                flush_interval: Duration::from_secs(15 * MINUTE),
                realtime_window: Duration::from_secs(60 * MINUTE),
            },
            flush_safety_factor: 1.5,
            aggregate_bucket: Duration::from_secs(5 * MINUTE),
            archive_every_n: 15,
            retention: RetentionSettings {
                aggregates: Duration::from_secs(7 * DAY),
                archive: Duration::from_secs(30 * DAY),
                ledger: Duration::from_secs(7 * DAY),
            },
            load_shedding: LoadShedSettings {
                enabled: true,
                threshold_pct: 70.0,
            },
            load_throttle: ThrottleSettings {
                enabled: true,
                threshold: 1000.0,
            },
            breaker: BreakerSettings {
                enabled: true,
                threshold: Duration::from_millis(1000),
                window: Duration::from_secs(15 * MINUTE),
                min_samples: 3,
                smoothing: 0.5,
            },
            mode: ModeSettings {
                auto: true,
                light_threshold_pct: 70.0,
                emergency_trips: 3,
                trip_window: Duration::from_secs(15 * MINUTE),
                min_dwell: Duration::ZERO,
                escalate_after: 1,
                recover_after: 2,
            },
            probe_timeout: Duration::from_secs(5),
            tick_deadline: Duration::from_secs(30),
            stale_after: Duration::from_secs(15 * MINUTE),
        }
    }
}

impl Settings {
    /// Profile for an operating mode.
    pub fn profile(&self, mode: Mode) -> &ModeProfile {
        match mode {
            Mode::Normal => &self.normal,
            Mode::Light => &self.light,
            Mode::Emergency => &self.emergency,
        }
    }

    /// Whether collection is enabled globally and for `kind`.
    pub fn kind_enabled(&self, kind: &str) -> bool {
        self.enabled && !self.disabled_kinds.contains(kind)
    }

    /// Parse a raw key/value map. Invalid values use `fallback` (the last
    /// good raw value per key) before the default.
    pub fn parse(
        raw: &BTreeMap<String, String>,
        fallback: &HashMap<String, String>,
    ) -> (Self, Vec<ConfigWarning>, HashMap<String, String>) {
        let mut p = Parser {
            raw,
            fallback,
            accepted: HashMap::new(),
            warnings: Vec::new(),
        };
        let d = Settings::default();

        let disabled_kinds = raw
            .iter()
            .filter_map(|(key, value)| {
                let kind = key
                    .strip_prefix(KIND_PREFIX)?
                    .strip_suffix(KIND_ENABLED_SUFFIX)?;
                (!kind.is_empty() && parse_bool(value) == Ok(false)).then(|| kind.to_string())
            })
            .collect();

        let settings = Settings {
            enabled: p.get(KEY_ENABLED, d.enabled, parse_bool),
            disabled_kinds,
            ring_capacity: p.get(KEY_RING_CAPACITY, d.ring_capacity, parse_capacity),
            ring_max_details: p.get(KEY_RING_MAX_DETAILS, d.ring_max_details, parse_u32),
            normal: ModeProfile {
                sample_interval: p.get("sample.interval", d.normal.sample_interval, parse_interval),
                flush_interval: p.get("flush.interval", d.normal.flush_interval, parse_interval),
                realtime_window: p.get("realtime.window", d.normal.realtime_window, parse_interval),
            },
            light: ModeProfile {
                sample_interval: p.get(
                    "sample.interval.light",
                    d.light.sample_interval,
                    parse_interval,
                ),
                flush_interval: p.get("flush.interval.light", d.light.flush_interval, parse_interval),
                realtime_window: p.get(
                    "realtime.window.light",
                    d.light.realtime_window,
                    parse_interval,
                ),
            },
            emergency: ModeProfile {
                sample_interval: p.get(
                    "sample.interval.emergency",
                    d.emergency.sample_interval,
                    parse_interval,
                ),
                flush_interval: p.get(
                    "flush.interval.emergency",
                    d.emergency.flush_interval,
                    parse_interval,
                ),
                realtime_window: p.get(
                    "realtime.window.emergency",
                    d.emergency.realtime_window,
                    parse_interval,
                ),
            },
            flush_safety_factor: p.get(
                KEY_FLUSH_SAFETY_FACTOR,
                d.flush_safety_factor,
                parse_positive_f64,
            ),
            aggregate_bucket: p.get(KEY_AGGREGATE_BUCKET, d.aggregate_bucket, parse_interval),
            archive_every_n: p.get(KEY_ARCHIVE_EVERY_N, d.archive_every_n, parse_nonzero_u64),
            retention: RetentionSettings {
                aggregates: p.get(KEY_RETENTION_AGGREGATES, d.retention.aggregates, parse_interval),
                archive: p.get(KEY_RETENTION_ARCHIVE, d.retention.archive, parse_interval),
                ledger: p.get(KEY_RETENTION_LEDGER, d.retention.ledger, parse_interval),
            },
            load_shedding: LoadShedSettings {
                enabled: p.get(KEY_LOAD_SHEDDING_ENABLED, d.load_shedding.enabled, parse_bool),
                threshold_pct: p.get(
                    KEY_LOAD_SHEDDING_THRESHOLD,
                    d.load_shedding.threshold_pct,
                    parse_pct,
                ),
            },
            load_throttle: ThrottleSettings {
                enabled: p.get(KEY_LOAD_THROTTLE_ENABLED, d.load_throttle.enabled, parse_bool),
                threshold: p.get(
                    KEY_LOAD_THROTTLE_THRESHOLD,
                    d.load_throttle.threshold,
                    parse_positive_f64,
                ),
            },
            breaker: BreakerSettings {
                enabled: p.get(KEY_BREAKER_ENABLED, d.breaker.enabled, parse_bool),
                threshold: p.get(KEY_BREAKER_THRESHOLD, d.breaker.threshold, parse_interval),
                window: p.get(KEY_BREAKER_WINDOW, d.breaker.window, parse_interval),
                min_samples: p.get(KEY_BREAKER_MIN_SAMPLES, d.breaker.min_samples, parse_nonzero_u32),
                smoothing: p.get(KEY_BREAKER_SMOOTHING, d.breaker.smoothing, parse_fraction),
            },
            mode: ModeSettings {
                auto: p.get(KEY_MODE_AUTO, d.mode.auto, parse_bool),
                light_threshold_pct: p.get(
                    KEY_MODE_LIGHT_THRESHOLD,
                    d.mode.light_threshold_pct,
                    parse_pct,
                ),
                emergency_trips: p.get(
                    KEY_MODE_EMERGENCY_TRIPS,
                    d.mode.emergency_trips,
                    parse_nonzero_u32,
                ),
                trip_window: p.get(KEY_MODE_TRIP_WINDOW, d.mode.trip_window, parse_interval),
                min_dwell: p.get(KEY_MODE_MIN_DWELL, d.mode.min_dwell, parse_duration),
                escalate_after: p.get(
                    KEY_MODE_ESCALATE_AFTER,
                    d.mode.escalate_after,
                    parse_nonzero_u32,
                ),
                recover_after: p.get(
                    KEY_MODE_RECOVER_AFTER,
                    d.mode.recover_after,
                    parse_nonzero_u32,
                ),
            },
            probe_timeout: p.get(KEY_PROBE_TIMEOUT, d.probe_timeout, parse_interval),
            tick_deadline: p.get(KEY_TICK_DEADLINE, d.tick_deadline, parse_interval),
            stale_after: p.get(KEY_HEALTH_STALE_AFTER, d.stale_after, parse_interval),
        };

        (settings, p.warnings, p.accepted)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Reads a fresh [`Settings`] snapshot from the state service.
///
/// Only the last-known-good raw value per key is remembered between reads,
/// and only to stand in for a value that currently fails to parse. Warnings
/// are logged when the set of findings changes, not on every read.
#[derive(Clone)]
pub struct SettingsReader {
    state: Arc<dyn StateService>,
    last_good: Arc<Mutex<HashMap<String, String>>>,
    logged: Arc<Mutex<Vec<ConfigWarning>>>,
}

impl std::fmt::Debug for SettingsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsReader").finish_non_exhaustive()
    }
}

impl SettingsReader {
    pub fn new(state: Arc<dyn StateService>) -> Self {
        Self {
            state,
            last_good: Arc::new(Mutex::new(HashMap::new())),
            logged: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Load the current settings.
    ///
    /// Never fails: if the store itself is unreadable the built-in defaults are
    /// returned and the error is logged.
    pub fn load(&self) -> Settings {
        let raw = match self.state.settings() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "Settings store unreadable, using defaults");
                BTreeMap::new()
            }
        };

        let mut last_good = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
        let (settings, mut warnings, accepted) = Settings::parse(&raw, &last_good);
        last_good.extend(accepted);
        drop(last_good);

        warnings.extend(validate_settings(&settings));
        self.log_if_changed(warnings);
        settings
    }

    /// Findings of the latest load.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        self.logged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Log `warnings` unless they match the previous load's. Returns whether
    /// anything was logged.
    fn log_if_changed(&self, warnings: Vec<ConfigWarning>) -> bool {
        let mut logged = self.logged.lock().unwrap_or_else(PoisonError::into_inner);
        if *logged == warnings {
            return false;
        }
        if warnings.is_empty() {
            tracing::info!(cleared = logged.len(), "Settings warnings cleared");
        }
        for w in &warnings {
            tracing::warn!(key = w.key.as_deref().unwrap_or("-"), "{}", w.message);
        }
        *logged = warnings;
        true
    }

    /// Raw key/value view, as stored.
    pub fn raw(&self) -> Result<BTreeMap<String, String>, StorageError> {
        self.state.settings()
    }

    /// Set a key after checking that it parses.
    pub fn put(&self, key: &str, value: &str) -> Result<(), ConfigWarning> {
        let mut probe = BTreeMap::new();
        probe.insert(key.to_string(), value.to_string());
        let (_, warnings, _) = Settings::parse(&probe, &HashMap::new());
        if let Some(w) = warnings.into_iter().next() {
            return Err(w);
        }
        self.state
            .put_setting(key, value)
            .map_err(|e| ConfigWarning::new(key, format!("store write failed: {e}")))?;
        tracing::info!(key, value, "Setting updated");
        Ok(())
    }
}

// =============================================================================
// Parsing
// =============================================================================

struct Parser<'a> {
    raw: &'a BTreeMap<String, String>,
    fallback: &'a HashMap<String, String>,
    accepted: HashMap<String, String>,
    warnings: Vec<ConfigWarning>,
}

impl Parser<'_> {
    fn get<T>(&mut self, key: &str, default: T, parse: fn(&str) -> Result<T, String>) -> T {
        let Some(raw) = self.raw.get(key) else {
            return default;
        };
        match parse(raw) {
            Ok(value) => {
                self.accepted.insert(key.to_string(), raw.clone());
                value
            }
            Err(e) => {
                let fallback = self.fallback.get(key).and_then(|s| parse(s).ok());
                let using = if fallback.is_some() {
                    "last good value"
                } else {
                    "default"
                };
                self.warnings.push(ConfigWarning::new(
                    key,
                    format!("invalid value '{raw}': {e}; using {using}"),
                ));
                fallback.unwrap_or(default)
            }
        }
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

fn parse_u32(s: &str) -> Result<u32, String> {
    s.trim().parse::<u32>().map_err(|e| e.to_string())
}

fn parse_nonzero_u32(s: &str) -> Result<u32, String> {
    match parse_u32(s)? {
        0 => Err("must be at least 1".to_string()),
        n => Ok(n),
    }
}

fn parse_nonzero_u64(s: &str) -> Result<u64, String> {
    match s.trim().parse::<u64>().map_err(|e| e.to_string())? {
        0 => Err("must be at least 1".to_string()),
        n => Ok(n),
    }
}

fn parse_capacity(s: &str) -> Result<u32, String> {
    let n = parse_u32(s)?;
    if (MIN_CAPACITY..=MAX_CAPACITY).contains(&n) {
        Ok(n)
    } else {
        Err(format!("must be within [{MIN_CAPACITY}, {MAX_CAPACITY}]"))
    }
}

fn parse_f64(s: &str) -> Result<f64, String> {
    let v = s.trim().parse::<f64>().map_err(|e| e.to_string())?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err("must be finite".to_string())
    }
}

fn parse_positive_f64(s: &str) -> Result<f64, String> {
    match parse_f64(s)? {
        v if v > 0.0 => Ok(v),
        _ => Err("must be positive".to_string()),
    }
}

fn parse_pct(s: &str) -> Result<f64, String> {
    match parse_f64(s.trim().trim_end_matches('%'))? {
        v if v > 0.0 && v <= 100.0 => Ok(v),
        _ => Err("must be within (0, 100]".to_string()),
    }
}

fn parse_fraction(s: &str) -> Result<f64, String> {
    match parse_f64(s)? {
        v if v > 0.0 && v <= 1.0 => Ok(v),
        _ => Err("must be within (0, 1]".to_string()),
    }
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    match parse_duration(s)? {
        d if d.is_zero() => Err("must be non-zero".to_string()),
        d => Ok(d),
    }
}
