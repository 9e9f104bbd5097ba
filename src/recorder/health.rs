//! Status and health report.
//!
//! Everything here is derived on demand: staleness comes from the ledger's
//! last successful attempt per kind, trip counts from skipped attempts in the
//! trip window. Nothing is stored as a flag.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::governor::{BreakerVerdict, LoadSnapshot};
use crate::recorder::{Recorder, age, since};
use crate::storage::{ModeState, StorageError};

/// Ring occupancy for one kind.
#[derive(Debug, Clone, Serialize)]
pub struct RingFootprint {
    pub capacity: u32,
    pub occupied: usize,
    pub generation: u64,
    pub oldest_tick: Option<u64>,
    pub newest_tick: Option<u64>,
}

/// Per-kind health.
#[derive(Debug, Clone, Serialize)]
pub struct KindStatus {
    pub kind: String,
    pub enabled: bool,
    pub last_success: Option<DateTime<Utc>>,
    /// No successful attempt within `health.stale_after`.
    pub stale: bool,
    pub trips: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring: Option<RingFootprint>,
    pub flush_cursor: Option<u64>,
}

/// Row counts per durable tier plus total ring slots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageFootprint {
    pub ring_slots: u64,
    pub ring_occupied: u64,
    pub aggregates: u64,
    pub archive_samples: u64,
    pub attempts: u64,
}

/// Answer of the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub healthy: bool,
    pub enabled: bool,
    pub auto_mode: bool,
    pub mode: ModeState,
    pub trips_total: u32,
    pub load: Option<LoadSnapshot>,
    pub kinds: Vec<KindStatus>,
    pub storage: StorageFootprint,
}

impl Recorder {
    /// Build the status report as of now.
    ///
    /// Healthy means: collection enabled, no kind stale, not in emergency mode.
    pub fn status(&self) -> Result<StatusReport, StorageError> {
        let now = Utc::now();
        let settings = self.settings.load();
        let mode = self.governor.mode()?;

        let trip_since = since(now, settings.mode.trip_window);
        let trips = self.ledger.trips_by_kind(trip_since)?;
        let mut successes = self.ledger.last_successes()?;
        for kind in self.kinds() {
            successes.entry(kind).or_insert(None);
        }

        let mut storage = StorageFootprint {
            aggregates: self.aggregates.count()?,
            archive_samples: self.archive.count()?,
            attempts: self.ledger.count()?,
            ..Default::default()
        };

        let mut kinds = Vec::with_capacity(successes.len());
        for (kind, last_success) in successes {
            let ring = self.rings.get(&kind).map(|ring| RingFootprint {
                capacity: ring.capacity(),
                occupied: ring.occupied(),
                generation: ring.generation(),
                oldest_tick: ring.oldest_tick(),
                newest_tick: ring.newest_tick(),
            });
            if let Some(footprint) = &ring {
                storage.ring_slots += u64::from(footprint.capacity);
                storage.ring_occupied += footprint.occupied as u64;
            }

            let enabled = settings.kind_enabled(&kind);
            let stale = enabled
                && last_success.is_none_or(|at| age(at, now) > settings.stale_after);
            let breaker = if settings.breaker.enabled {
                self.governor
                    .breaker(&kind, &settings, now)
                    .inspect_err(|e| tracing::warn!(kind = %kind, error = %e, "Breaker unreadable"))
                    .ok()
            } else {
                None
            };

            kinds.push(KindStatus {
                flush_cursor: self.aggregates.cursor(&kind)?,
                trips: trips.get(&kind).copied().unwrap_or(0),
                kind,
                enabled,
                last_success,
                stale,
                breaker,
                ring,
            });
        }

        let trips_total = kinds.iter().map(|k| k.trips).sum();
        let healthy = settings.enabled
            && kinds.iter().all(|k| !k.stale)
            && mode.mode != crate::storage::Mode::Emergency;

        Ok(StatusReport {
            generated_at: now,
            healthy,
            enabled: settings.enabled,
            auto_mode: settings.mode.auto,
            mode,
            trips_total,
            load: self.governor.load(),
            kinds,
            storage,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::governor::{SkipReason, StaticLoad};
    use crate::probe::{Probe, ProbeContext, ProbeError, Record};
    use crate::recorder::Recorder;
    use crate::storage::{Mode, StorageBuilder, StorageHandles};

    struct OkProbe;

    #[async_trait::async_trait]
    impl Probe for OkProbe {
        fn name(&self) -> &str {
            "ok"
        }
        fn kind(&self) -> &str {
            "tcp"
        }
        async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
            Ok(vec![Record::metric("up", 1.0)])
        }
    }

    fn setup() -> (Recorder, StorageHandles) {
        let storage = StorageBuilder::in_memory().build().unwrap();
        let mut recorder = Recorder::new(&storage, Arc::new(StaticLoad::new(5.0, 0.0))).unwrap();
        recorder.register(Arc::new(OkProbe));
        (recorder, storage)
    }

    #[tokio::test]
    async fn test_fresh_kind_is_stale_until_first_success() {
        let (recorder, _storage) = setup();
        let status = recorder.status().unwrap();
        assert!(!status.healthy);
        assert!(status.kinds[0].stale);

        recorder.tick("tcp").await;
        let status = recorder.status().unwrap();
        assert!(status.healthy);
        let tcp = &status.kinds[0];
        assert!(!tcp.stale);
        assert!(tcp.last_success.is_some());
        assert_eq!(tcp.ring.as_ref().unwrap().occupied, 1);
        assert_eq!(status.storage.attempts, 1);
        assert_eq!(status.storage.ring_slots, 120);
    }

    #[tokio::test]
    async fn test_trips_and_emergency_reported() {
        let (recorder, storage) = setup();
        recorder.tick("tcp").await;
        let open = SkipReason::CircuitOpen {
            threshold_ms: 1000,
            avg_ms: 1500.0,
            samples: 3,
        };
        storage.ledger.record_skip("tcp", 10, &open).unwrap();
        storage.ledger.record_skip("tcp", 11, &open).unwrap();
        recorder.set_mode(Mode::Emergency, "test").unwrap();

        let status = recorder.status().unwrap();
        assert_eq!(status.trips_total, 2);
        assert_eq!(status.kinds[0].trips, 2);
        assert_eq!(status.mode.mode, Mode::Emergency);
        assert!(!status.healthy);
    }

    #[tokio::test]
    async fn test_disabled_kind_is_never_stale() {
        let (recorder, _storage) = setup();
        recorder
            .settings()
            .put("collection.tcp.enabled", "false")
            .unwrap();
        let status = recorder.status().unwrap();
        assert!(!status.kinds[0].enabled);
        assert!(!status.kinds[0].stale);
    }
}
