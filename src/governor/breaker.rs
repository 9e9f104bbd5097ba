//! Circuit breaker over recent attempt durations.
//!
//! Stateless: the verdict is recomputed from the ledger's trailing window on
//! every evaluation, so the breaker closes by itself once recent attempts get
//! fast again or slow ones age out of the window. There is no half-open state.

use serde::Serialize;

use crate::config::BreakerSettings;
use crate::governor::SkipReason;

/// Result of one breaker evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerVerdict {
    pub open: bool,
    /// Exponentially weighted moving average of the window, if non-empty.
    pub avg_ms: Option<f64>,
    pub samples: u32,
    pub threshold_ms: u64,
}

impl BreakerVerdict {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        if !self.open {
            return None;
        }
        Some(SkipReason::CircuitOpen {
            threshold_ms: self.threshold_ms,
            avg_ms: self.avg_ms.unwrap_or_default(),
            samples: self.samples,
        })
    }
}

/// Evaluate the breaker over `durations_ms`, oldest first.
///
/// Opens only with at least `min_samples` durations and a moving average
/// strictly above the threshold.
pub fn evaluate(durations_ms: &[u64], settings: &BreakerSettings) -> BreakerVerdict {
    let threshold_ms = settings.threshold.as_millis().min(u128::from(u64::MAX)) as u64;
    let samples = durations_ms.len().min(u32::MAX as usize) as u32;
    let avg_ms = moving_average(durations_ms, settings.smoothing);

    let open = settings.enabled
        && samples >= settings.min_samples
        && avg_ms.is_some_and(|avg| avg > threshold_ms as f64);

    BreakerVerdict {
        open,
        avg_ms,
        samples,
        threshold_ms,
    }
}

/// EWMA seeded with the oldest value: `avg = a * x + (1 - a) * avg`.
fn moving_average(values: &[u64], smoothing: f64) -> Option<f64> {
    let (first, rest) = values.split_first()?;
    let alpha = smoothing.clamp(f64::EPSILON, 1.0);
    Some(
        rest.iter()
            .fold(*first as f64, |avg, &x| alpha * x as f64 + (1.0 - alpha) * avg),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            enabled: true,
            threshold: Duration::from_millis(1000),
            window: Duration::from_secs(900),
            min_samples: 3,
            smoothing: 0.5,
        }
    }

    #[test]
    fn test_opens_on_third_slow_attempt_then_recovers() {
        let s = settings();
        assert!(!evaluate(&[1500], &s).open);
        assert!(!evaluate(&[1500, 1600], &s).open);

        let third = evaluate(&[1500, 1600, 1400], &s);
        assert!(third.open);
        assert_eq!(third.avg_ms, Some(1475.0));
        assert_eq!(third.samples, 3);

        let fourth = evaluate(&[1500, 1600, 1400, 200], &s);
        assert!(!fourth.open);
        assert_eq!(fourth.avg_ms, Some(837.5));
    }

    #[test]
    fn test_below_min_samples_never_opens() {
        let v = evaluate(&[60_000, 60_000], &settings());
        assert!(!v.open);
        assert!(v.skip_reason().is_none());
    }

    #[test]
    fn test_empty_window() {
        let v = evaluate(&[], &settings());
        assert!(!v.open);
        assert_eq!(v.avg_ms, None);
    }

    #[test]
    fn test_disabled() {
        let s = BreakerSettings {
            enabled: false,
            ..settings()
        };
        assert!(!evaluate(&[5000, 5000, 5000], &s).open);
    }

    #[test]
    fn test_smoothing_one_is_last_value() {
        let s = BreakerSettings {
            smoothing: 1.0,
            ..settings()
        };
        let v = evaluate(&[5000, 5000, 900], &s);
        assert_eq!(v.avg_ms, Some(900.0));
        assert!(!v.open);
    }

    #[test]
    fn test_skip_reason_carries_threshold() {
        let v = evaluate(&[2000, 2000, 2000], &settings());
        match v.skip_reason() {
            Some(SkipReason::CircuitOpen {
                threshold_ms,
                avg_ms,
                samples,
            }) => {
                assert_eq!(threshold_ms, 1000);
                assert_eq!(avg_ms, 2000.0);
                assert_eq!(samples, 3);
            }
            other => panic!("expected circuit open, got {other:?}"),
        }
    }
}
