//! Core data types for the durable tiers.
//!
//! - [`AggregateBucket`]: time-bucketed rollup of ring rows
//! - [`ArchiveRecord`]: append-only copy of a raw ring row
//! - [`CollectionAttempt`]: ledger row for one tick attempt
//! - [`Mode`] / [`ModeState`]: the governor's operating point

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::governor::SkipReason;
use crate::ring::{DetailRow, SampleMeta};

/// Ledger row identifier.
pub type AttemptId = i64;

/// Discrete operating point controlling sampling aggressiveness.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Mode {
    /// Full-rate collection.
    #[default]
    Normal,
    /// Reduced cadence under resource pressure.
    Light,
    /// Minimal cadence after repeated circuit-breaker trips.
    Emergency,
}

/// Persisted operating mode record.
///
/// `pending` / `pending_count` carry the consecutive-observation counter used
/// for hysteresis; `version` is bumped on every write for compare-and-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeState {
    pub mode: Mode,
    pub entered_at: DateTime<Utc>,
    pub reason: String,
    pub pending: Option<Mode>,
    pub pending_count: u32,
    pub version: i64,
}

impl ModeState {
    /// Initial state written when no mode record exists.
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            mode: Mode::Normal,
            entered_at: now,
            reason: "initial".to_string(),
            pending: None,
            pending_count: 0,
            version: 0,
        }
    }
}

/// Rollup statistics for one `(bucket, dimensional key)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub kind: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub dim_key: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl AggregateBucket {
    /// Mean of the accumulated values.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Durable copy of one raw ring row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub kind: String,
    pub tick: u64,
    pub sample_id: String,
    pub captured_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub meta: SampleMeta,
    pub details: Vec<DetailRow>,
}

/// Ledger row for one collection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionAttempt {
    pub id: AttemptId,
    pub kind: String,
    pub tick: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub skipped: bool,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<String>,
}

impl CollectionAttempt {
    /// Whether the attempt has been finalized.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Stable identifier of a ring sample: `<kind>:<tick>`.
pub fn sample_id(kind: &str, tick: u64) -> String {
    format!("{kind}:{tick}")
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_mode_from_str_case_insensitive() {
        assert_eq!(Mode::from_str("normal").unwrap(), Mode::Normal);
        assert_eq!(Mode::from_str("LIGHT").unwrap(), Mode::Light);
        assert_eq!(Mode::from_str("Emergency").unwrap(), Mode::Emergency);
        assert!(Mode::from_str("panic").is_err());
    }

    #[test]
    fn test_mode_as_str() {
        assert_eq!(Mode::Normal.as_ref(), "normal");
        assert_eq!(Mode::Light.as_ref(), "light");
        assert_eq!(Mode::Emergency.to_string(), "emergency");
    }

    #[test]
    fn test_bucket_avg() {
        let now = Utc::now();
        let bucket = AggregateBucket {
            kind: "tcp".to_string(),
            bucket_start: now,
            bucket_end: now,
            dim_key: "latency".to_string(),
            count: 4,
            sum: 10.0,
            min: 1.0,
            max: 4.0,
        };
        assert_eq!(bucket.avg(), 2.5);

        let empty = AggregateBucket { count: 0, ..bucket };
        assert_eq!(empty.avg(), 0.0);
    }

    #[test]
    fn test_micros_roundtrip_truncates_to_micros() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let back = from_micros(to_micros(ts));
        assert_eq!(back.timestamp_subsec_micros(), 123_456);
        assert_eq!(sample_id("tcp", 42), "tcp:42");
    }
}
