//! Load shedding and load throttling gates.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::config::{LoadShedSettings, ThrottleSettings};
use crate::governor::SkipReason;

/// Point-in-time load reading of the monitored host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSnapshot {
    /// Resource utilization, 0-100 (may exceed 100 when oversubscribed).
    pub utilization_pct: f64,
    /// Recent workload intensity in operations per second.
    pub workload_rate: f64,
}

/// Source of [`LoadSnapshot`]s.
pub trait LoadSource: Send + Sync {
    fn sample(&self) -> std::io::Result<LoadSnapshot>;
}

/// Fixed, externally updated load. Useful for tests and for hosts that push
/// their own load readings.
#[derive(Debug, Default)]
pub struct StaticLoad {
    current: Mutex<LoadSnapshot>,
}

impl StaticLoad {
    pub fn new(utilization_pct: f64, workload_rate: f64) -> Self {
        Self {
            current: Mutex::new(LoadSnapshot {
                utilization_pct,
                workload_rate,
            }),
        }
    }

    pub fn set(&self, snapshot: LoadSnapshot) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn set_utilization(&self, utilization_pct: f64) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .utilization_pct = utilization_pct;
    }
}

impl LoadSource for StaticLoad {
    fn sample(&self) -> std::io::Result<LoadSnapshot> {
        Ok(*self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Skip when utilization is at or above the threshold.
pub fn shed_gate(settings: &LoadShedSettings, load: &LoadSnapshot) -> Option<SkipReason> {
    (settings.enabled && load.utilization_pct >= settings.threshold_pct).then_some(
        SkipReason::LoadShed {
            threshold_pct: settings.threshold_pct,
            observed_pct: load.utilization_pct,
        },
    )
}

/// Skip when the workload rate exceeds the threshold.
pub fn throttle_gate(settings: &ThrottleSettings, load: &LoadSnapshot) -> Option<SkipReason> {
    (settings.enabled && load.workload_rate > settings.threshold).then_some(
        SkipReason::LoadThrottled {
            threshold: settings.threshold,
            observed: load.workload_rate,
        },
    )
}
