//! Slot payload types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Mode;

/// Sampling metadata recorded alongside every header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleMeta {
    /// Operating mode at capture time.
    pub mode: Mode,
    /// Probes that returned records.
    pub probes_ok: u32,
    /// Probes that failed or timed out.
    pub probes_failed: u32,
    /// Wall time spent collecting, in milliseconds.
    pub duration_ms: u64,
}

/// Headline values of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleHeader {
    pub captured_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub meta: SampleMeta,
}

impl SampleHeader {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            metrics: BTreeMap::new(),
            meta: SampleMeta::default(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_meta(mut self, meta: SampleMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// One ranked breakdown row owned by a slot (e.g. a top-K entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRow {
    /// 1-based rank within the slot.
    pub rank: u32,
    /// Breakdown family, usually the producing probe.
    pub group: String,
    /// Item identity within the group.
    pub key: String,
    pub value: f64,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl DetailRow {
    pub fn new(group: impl Into<String>, key: impl Into<String>, value: f64) -> Self {
        Self {
            rank: 0,
            group: group.into(),
            key: key.into(),
            value,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// The header row of a slot. One exists per slot for the lifetime of the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderRow {
    pub slot_id: u32,
    /// Tick of the last write, `None` until the slot is first written.
    pub last_write_tick: Option<u64>,
    pub header: Option<SampleHeader>,
}

impl HeaderRow {
    pub(crate) fn empty(slot_id: u32) -> Self {
        Self {
            slot_id,
            last_write_tick: None,
            header: None,
        }
    }
}

/// A resident sample as returned by ring reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingEntry {
    pub kind: String,
    pub tick: u64,
    pub slot_id: u32,
    pub header: SampleHeader,
    pub details: Vec<DetailRow>,
}
