//! Safety governor.
//!
//! Decides, per tick, whether a collection kind may be sampled:
//!
//! 1. disabled switch (global or per kind)
//! 2. load shedding (utilization >= threshold)
//! 3. load throttling (workload rate > threshold)
//! 4. circuit breaker (smoothed recent durations > threshold)
//!
//! The first gate that fires is the recorded [`SkipReason`]. Separately, the
//! operating mode is re-evaluated on its own schedule by
//! [`Governor::reevaluate_mode`].

pub mod breaker;
pub mod load;
pub mod mode;
mod skip;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Settings;
use crate::ledger::Ledger;
use crate::recorder::since;
use crate::state::StateService;
use crate::storage::{Mode, ModeState, StorageError};

pub use breaker::BreakerVerdict;
pub use load::{LoadSnapshot, LoadSource, StaticLoad};
pub use mode::{ModeDecision, ModeInputs};
pub use skip::SkipReason;

/// Compare-and-set attempts per re-evaluation before yielding to the
/// concurrent evaluator that keeps winning.
const MODE_CAS_RETRIES: usize = 4;

/// Result of [`Governor::reevaluate_mode`].
#[derive(Debug, Clone, Serialize)]
pub struct ModeEvaluation {
    pub previous: Mode,
    pub current: ModeState,
    pub changed: bool,
    pub suppressed: bool,
    pub inputs: ModeInputs,
}

/// Gate evaluation and mode control.
#[derive(Clone)]
pub struct Governor {
    state: Arc<dyn StateService>,
    ledger: Ledger,
    load: Arc<dyn LoadSource>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor").finish_non_exhaustive()
    }
}

impl Governor {
    pub fn new(state: Arc<dyn StateService>, ledger: Ledger, load: Arc<dyn LoadSource>) -> Self {
        Self {
            state,
            ledger,
            load,
        }
    }

    /// Current load reading, or `None` (logged) if the source failed.
    pub fn load(&self) -> Option<LoadSnapshot> {
        self.load
            .sample()
            .inspect_err(|e| tracing::warn!(error = %e, "Load source unreadable"))
            .ok()
    }

    /// Run the gates for `kind`. `None` means the tick may proceed.
    ///
    /// Never fails: an unreadable load source or ledger leaves the
    /// corresponding gate open (tick proceeds) and is logged.
    pub fn check(&self, kind: &str, settings: &Settings, now: DateTime<Utc>) -> Option<SkipReason> {
        if !settings.enabled {
            return Some(SkipReason::Disabled {
                scope: "global".to_string(),
            });
        }
        if !settings.kind_enabled(kind) {
            return Some(SkipReason::Disabled {
                scope: kind.to_string(),
            });
        }

        if settings.load_shedding.enabled || settings.load_throttle.enabled {
            if let Some(snapshot) = self.load() {
                if let Some(reason) = load::shed_gate(&settings.load_shedding, &snapshot) {
                    return Some(reason);
                }
                if let Some(reason) = load::throttle_gate(&settings.load_throttle, &snapshot) {
                    return Some(reason);
                }
            }
        }

        if settings.breaker.enabled {
            match self.breaker(kind, settings, now) {
                Ok(verdict) => return verdict.skip_reason(),
                Err(e) => {
                    tracing::error!(kind, error = %e, "Breaker window unreadable, treating as closed");
                }
            }
        }
        None
    }

    /// Breaker verdict for `kind` over the trailing window ending at `now`.
    pub fn breaker(
        &self,
        kind: &str,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<BreakerVerdict, StorageError> {
        let durations = self.ledger.recent_durations(kind, since(now, settings.breaker.window))?;
        Ok(breaker::evaluate(&durations, &settings.breaker))
    }

    /// Current mode record.
    pub fn mode(&self) -> Result<ModeState, StorageError> {
        self.state.mode()
    }

    /// Manual override. Always applied, whatever `mode.auto` says.
    pub fn set_mode(&self, mode: Mode, reason: &str) -> Result<ModeState, StorageError> {
        let previous = self.state.mode()?.mode;
        let next = self.state.set_mode(mode, reason, Utc::now())?;
        tracing::info!(from = %previous, to = %mode, reason, "Operating mode set manually");
        Ok(next)
    }

    /// Re-evaluate the operating mode from utilization and recent trips.
    pub fn reevaluate_mode(
        &self,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<ModeEvaluation, StorageError> {
        let inputs = ModeInputs {
            utilization_pct: self.load().map(|l| l.utilization_pct),
            trips: self.ledger.trip_count(None, since(now, settings.mode.trip_window))?,
        };
        self.apply_inputs(inputs, settings, now)
    }

    /// Decide and persist the next mode for the given observations.
    pub fn apply_inputs(
        &self,
        inputs: ModeInputs,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<ModeEvaluation, StorageError> {
        for _ in 0..MODE_CAS_RETRIES {
            let current = self.state.mode()?;
            let previous = current.mode;

            let (next, changed, suppressed) = match mode::decide(&current, &inputs, &settings.mode, now)
            {
                ModeDecision::Unchanged => (current, false, false),
                ModeDecision::Suppressed => {
                    tracing::debug!(mode = %previous, "Automatic mode changes disabled");
                    (current, false, true)
                }
                ModeDecision::Pending(next) => {
                    if !self.state.compare_and_set_mode(current.version, &next)? {
                        continue;
                    }
                    tracing::debug!(
                        mode = %next.mode,
                        pending = ?next.pending,
                        count = next.pending_count,
                        "Mode transition pending"
                    );
                    (next, false, false)
                }
                ModeDecision::Transition(next) => {
                    if !self.state.compare_and_set_mode(current.version, &next)? {
                        continue;
                    }
                    tracing::info!(
                        from = %previous,
                        to = %next.mode,
                        reason = %next.reason,
                        "Operating mode changed"
                    );
                    (next, true, false)
                }
            };

            return Ok(ModeEvaluation {
                previous,
                current: next,
                changed,
                suppressed,
                inputs,
            });
        }

        tracing::warn!("Mode record changed concurrently on every attempt, keeping stored mode");
        let current = self.state.mode()?;
        Ok(ModeEvaluation {
            previous: current.mode,
            current,
            changed: false,
            suppressed: false,
            inputs,
        })
    }
}
