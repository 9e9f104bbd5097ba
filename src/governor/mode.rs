//! Operating-mode state machine.
//!
//! [`decide`] is a pure function from the stored [`ModeState`] and the current
//! observations to the state that should be written next. Hysteresis is kept
//! in the record itself (`pending` + `pending_count`), so consecutive-count
//! rules survive restarts and concurrent evaluators agree on it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ModeSettings;
use crate::storage::{Mode, ModeState};

/// Signals the mode machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModeInputs {
    /// `None` when the load source could not be read.
    pub utilization_pct: Option<f64>,
    /// Circuit-breaker trips across all kinds within the trip window.
    pub trips: u32,
}

/// Outcome of one re-evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeDecision {
    /// Nothing to write.
    Unchanged,
    /// Auto mode is off; the current mode is left alone.
    Suppressed,
    /// Same mode, updated hysteresis bookkeeping.
    Pending(ModeState),
    /// New mode.
    Transition(ModeState),
}

fn severity(mode: Mode) -> u8 {
    match mode {
        Mode::Normal => 0,
        Mode::Light => 1,
        Mode::Emergency => 2,
    }
}

/// Mode the inputs point at, ignoring hysteresis.
pub fn target_mode(current: Mode, inputs: &ModeInputs, settings: &ModeSettings) -> (Mode, String) {
    if inputs.trips >= settings.emergency_trips {
        return (
            Mode::Emergency,
            format!(
                "{} breaker trips within {} (threshold {})",
                inputs.trips,
                humantime::format_duration(settings.trip_window),
                settings.emergency_trips
            ),
        );
    }

    let Some(util) = inputs.utilization_pct else {
        return (current, "utilization unavailable".to_string());
    };
    let pressured = util >= settings.light_threshold_pct;

    if current == Mode::Emergency {
        if inputs.trips > 0 {
            return (
                Mode::Emergency,
                format!("{} breaker trips still within window", inputs.trips),
            );
        }
        let next = if pressured { Mode::Light } else { Mode::Normal };
        return (
            next,
            format!(
                "breaker trips cleared, utilization {util:.1}% vs {:.1}%",
                settings.light_threshold_pct
            ),
        );
    }

    if pressured {
        (
            Mode::Light,
            format!(
                "utilization {util:.1}% >= {:.1}%",
                settings.light_threshold_pct
            ),
        )
    } else {
        (
            Mode::Normal,
            format!(
                "utilization {util:.1}% < {:.1}%",
                settings.light_threshold_pct
            ),
        )
    }
}

/// Decide the next mode record.
///
/// A move to a more severe mode needs `escalate_after` consecutive
/// qualifying observations, a move to a less severe one `recover_after`.
/// Either way at least `min_dwell` must have passed since `entered_at`.
pub fn decide(
    current: &ModeState,
    inputs: &ModeInputs,
    settings: &ModeSettings,
    now: DateTime<Utc>,
) -> ModeDecision {
    if !settings.auto {
        return ModeDecision::Suppressed;
    }

    let (target, reason) = target_mode(current.mode, inputs, settings);

    if target == current.mode {
        if current.pending.is_none() && current.pending_count == 0 {
            return ModeDecision::Unchanged;
        }
        return ModeDecision::Pending(ModeState {
            pending: None,
            pending_count: 0,
            version: current.version + 1,
            ..current.clone()
        });
    }

    let required = if severity(target) > severity(current.mode) {
        settings.escalate_after
    } else {
        settings.recover_after
    }
    .max(1);

    let count = if current.pending == Some(target) {
        current.pending_count.saturating_add(1)
    } else {
        1
    };

    let dwell = (now - current.entered_at).to_std().unwrap_or_default();
    if count >= required && dwell >= settings.min_dwell {
        return ModeDecision::Transition(ModeState {
            mode: target,
            entered_at: now,
            reason,
            pending: None,
            pending_count: 0,
            version: current.version + 1,
        });
    }

    ModeDecision::Pending(ModeState {
        pending: Some(target),
        pending_count: count,
        version: current.version + 1,
        ..current.clone()
    })
}
