//! Structured reasons for a gated tick.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a tick was skipped. Stored in the ledger as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum SkipReason {
    /// Collection switched off globally (`scope = "global"`) or for the kind.
    Disabled { scope: String },

    /// Resource utilization at or above the shedding threshold.
    LoadShed { threshold_pct: f64, observed_pct: f64 },

    /// Workload rate above the throttling threshold.
    LoadThrottled { threshold: f64, observed: f64 },

    /// Smoothed duration of recent successful attempts above the breaker
    /// threshold.
    CircuitOpen {
        threshold_ms: u64,
        avg_ms: f64,
        samples: u32,
    },
}

impl SkipReason {
    /// Gate name, matching the serialized tag.
    pub fn gate(&self) -> &'static str {
        match self {
            Self::Disabled { .. } => "disabled",
            Self::LoadShed { .. } => "load_shed",
            Self::LoadThrottled { .. } => "load_throttled",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }

    pub fn is_trip(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled { scope } => write!(f, "collection disabled ({scope})"),
            Self::LoadShed {
                threshold_pct,
                observed_pct,
            } => write!(
                f,
                "load shed: utilization {observed_pct:.1}% >= threshold {threshold_pct:.1}%"
            ),
            Self::LoadThrottled {
                threshold,
                observed,
            } => write!(
                f,
                "load throttled: workload rate {observed:.1}/s > threshold {threshold:.1}/s"
            ),
            Self::CircuitOpen {
                threshold_ms,
                avg_ms,
                samples,
            } => write!(
                f,
                "circuit open: average duration {avg_ms:.1}ms over {samples} attempts > threshold {threshold_ms}ms"
            ),
        }
    }
}
