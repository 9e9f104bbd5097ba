//! End-to-end behaviour of the collection pipeline.
//!
//! Each test runs against an isolated in-memory database and a static load
//! source, and drives the public API the way the scheduler and server do.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ringwarden::aggregate::AggregateQuery;
use ringwarden::archive::ArchiveQuery;
use ringwarden::governor::ModeInputs;
use ringwarden::ledger::AttemptQuery;
use ringwarden::{
    ArchiveSelector, DetailRow, Mode, Probe, ProbeContext, ProbeError, Record, Recorder, Ring,
    SampleHeader, Settings, SkipReason, StateService, StaticLoad, StorageBuilder, StorageHandles,
    TickOutcome,
};

// =============================================================================
// Test Helpers
// =============================================================================

/// Reports a fixed headline metric and a handful of detail rows.
struct SteadyProbe {
    kind: &'static str,
}

#[async_trait::async_trait]
impl Probe for SteadyProbe {
    fn name(&self) -> &str {
        "steady"
    }

    fn kind(&self) -> &str {
        self.kind
    }

    async fn collect(&self, ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
        let mut records = vec![Record::metric("latency_ms", 10.0 + ctx.tick as f64)];
        for (i, value) in [3.0, 9.0, 1.0, 7.0].into_iter().enumerate() {
            records.push(Record::Detail(DetailRow::new("conn", format!("c{i}"), value)));
        }
        Ok(records)
    }
}

/// Always fails.
struct BrokenProbe;

#[async_trait::async_trait]
impl Probe for BrokenProbe {
    fn name(&self) -> &str {
        "broken"
    }

    fn kind(&self) -> &str {
        "web"
    }

    async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
        Err(ProbeError::Failed("upstream refused".to_string()))
    }
}

/// Sleeps through any reasonable deadline.
struct StuckProbe;

#[async_trait::async_trait]
impl Probe for StuckProbe {
    fn name(&self) -> &str {
        "stuck"
    }

    fn kind(&self) -> &str {
        "web"
    }

    async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Vec::new())
    }
}

fn storage() -> StorageHandles {
    StorageBuilder::in_memory()
        .pool_size(2)
        .build()
        .expect("Failed to build storage")
}

fn recorder_with(storage: &StorageHandles, load: Arc<StaticLoad>) -> Recorder {
    let mut recorder = Recorder::new(storage, load).expect("Failed to create recorder");
    recorder.register(Arc::new(SteadyProbe { kind: "db" }));
    recorder
}

// =============================================================================
// Ring
// =============================================================================

#[test]
fn test_ring_wraps_and_keeps_newest_capacity_ticks() {
    let ring = Ring::new("db", 8).unwrap();
    let now = Utc::now();
    for tick in 0..10u64 {
        ring.write(
            tick,
            SampleHeader::new(now).with_metric("v", tick as f64),
            Vec::new(),
            20,
        );
    }

    assert_eq!(ring.get(0).unwrap().tick, 8);
    assert_eq!(ring.get(1).unwrap().tick, 9);
    assert!(ring.get_tick(0).is_none());
    assert!(ring.get_tick(1).is_none());

    let ticks: Vec<u64> = ring.snapshot().iter().map(|e| e.tick).collect();
    assert_eq!(ticks, (2..10).collect::<Vec<_>>());
    assert_eq!(ring.header_count(), 8);
    assert_eq!(ring.take_lost(), 2);
}

#[tokio::test]
async fn test_details_are_ranked_and_bounded() {
    let storage = storage();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
    recorder.settings().put("ring.max_details", "2").unwrap();

    let report = recorder.tick("db").await;
    assert!(report.success());

    let entry = recorder.read_ring("db", None).pop().unwrap();
    let values: Vec<f64> = entry.details.iter().map(|d| d.value).collect();
    assert_eq!(values, vec![9.0, 7.0]);
}

// =============================================================================
// Governor
// =============================================================================

#[tokio::test]
async fn test_load_shedding_skips_without_probing() {
    let storage = storage();
    let load = Arc::new(StaticLoad::new(85.0, 0.0));
    let recorder = recorder_with(&storage, load.clone());

    let report = recorder.tick("db").await;
    match &report.outcome {
        TickOutcome::Skipped {
            reason: SkipReason::LoadShed { threshold_pct, .. },
        } => assert_eq!(*threshold_pct, 70.0),
        other => panic!("expected load shed, got {other:?}"),
    }
    assert!(report.probes.is_empty());
    assert!(recorder.read_ring("db", None).is_empty());

    let attempts = storage
        .ledger
        .list(AttemptQuery {
            kind: Some("db".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].skipped);
    assert!(attempts[0].skip_reason.as_ref().unwrap().to_string().contains("70"));

    load.set_utilization(20.0);
    assert!(recorder.tick("db").await.success());
}

#[tokio::test]
async fn test_breaker_opens_on_slow_history_and_closes_after_fast_sample() {
    let storage = storage();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
    let now = Utc::now();

    let record = |minutes_ago: i64, ms: i64| {
        let start = now - chrono::Duration::minutes(minutes_ago);
        let id = storage.ledger.record_start_at("db", 0, start).unwrap();
        storage
            .ledger
            .record_end_at(id, true, None, start + chrono::Duration::milliseconds(ms))
            .unwrap();
    };
    record(4, 1500);
    record(3, 1600);
    record(2, 1400);

    let report = recorder.tick("db").await;
    assert!(matches!(
        report.outcome,
        TickOutcome::Skipped {
            reason: SkipReason::CircuitOpen { threshold_ms: 1000, .. }
        }
    ));
    assert_eq!(
        storage
            .ledger
            .trip_count(Some("db"), now - chrono::Duration::minutes(15))
            .unwrap(),
        1
    );

    record(1, 200);
    let report = recorder.tick("db").await;
    assert!(report.success(), "breaker should close: {:?}", report.outcome);
}

#[tokio::test]
async fn test_mode_escalates_then_recovers_after_two_calm_readings() {
    let storage = storage();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::default()));
    let settings = Settings::default();
    let governor = recorder.governor();
    let start = Utc::now();

    let mut modes = Vec::new();
    for (i, pct) in [50.0, 50.0, 75.0, 80.0, 50.0, 50.0].into_iter().enumerate() {
        let inputs = ModeInputs {
            utilization_pct: Some(pct),
            trips: 0,
        };
        let at = start + chrono::Duration::seconds(i as i64);
        let evaluation = governor.apply_inputs(inputs, &settings, at).unwrap();
        modes.push(evaluation.current.mode);
    }

    assert_eq!(
        modes,
        vec![
            Mode::Normal,
            Mode::Normal,
            Mode::Light,
            Mode::Light,
            Mode::Light,
            Mode::Normal
        ]
    );
    assert_eq!(recorder.governor().mode().unwrap().mode, Mode::Normal);
}

#[tokio::test]
async fn test_min_dwell_holds_mode_until_elapsed() {
    let storage = storage();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::default()));
    let mut settings = Settings::default();
    settings.mode.min_dwell = Duration::from_secs(600);
    let governor = recorder.governor();
    let start = governor.mode().unwrap().entered_at;

    let hot = ModeInputs {
        utilization_pct: Some(90.0),
        trips: 0,
    };
    let early = governor
        .apply_inputs(hot, &settings, start + chrono::Duration::seconds(60))
        .unwrap();
    assert_eq!(early.current.mode, Mode::Normal);
    assert_eq!(early.current.pending, Some(Mode::Light));

    let late = governor
        .apply_inputs(hot, &settings, start + chrono::Duration::seconds(601))
        .unwrap();
    assert!(late.changed);
    assert_eq!(late.current.mode, Mode::Light);
}

#[tokio::test]
async fn test_breaker_trips_drive_emergency_mode() {
    let storage = storage();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(10.0, 0.0)));
    let open = SkipReason::CircuitOpen {
        threshold_ms: 1000,
        avg_ms: 2400.0,
        samples: 3,
    };
    for tick in 0..3 {
        storage.ledger.record_skip("db", tick, &open).unwrap();
    }

    let evaluation = recorder.reevaluate_mode().unwrap();
    assert!(evaluation.changed);
    assert_eq!(evaluation.current.mode, Mode::Emergency);
    assert!(!recorder.status().unwrap().healthy);
}

#[tokio::test]
async fn test_manual_override_ignores_auto_switch() {
    let storage = storage();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(90.0, 0.0)));
    recorder.settings().put("mode.auto", "false").unwrap();

    let evaluation = recorder.reevaluate_mode().unwrap();
    assert!(evaluation.suppressed);
    assert_eq!(evaluation.current.mode, Mode::Normal);

    let state = recorder.set_mode(Mode::Emergency, "maintenance").unwrap();
    assert_eq!(state.mode, Mode::Emergency);
    assert_eq!(state.reason, "maintenance");
}

// =============================================================================
// Orchestration
// =============================================================================

#[tokio::test]
async fn test_failing_and_stuck_probes_do_not_block_others() {
    let storage = storage();
    let mut recorder = Recorder::new(&storage, Arc::new(StaticLoad::new(5.0, 0.0))).unwrap();
    recorder.register(Arc::new(BrokenProbe));
    recorder.register(Arc::new(SteadyProbe { kind: "web" }));
    recorder.settings().put("probe.timeout", "50ms").unwrap();
    recorder.register(Arc::new(StuckProbe));

    let report = recorder.tick("web").await;
    assert!(!report.skipped());
    assert!(!report.success());
    assert_eq!(report.probes.len(), 3);
    assert!(report.probes[1].ok);
    assert!(report.slot.is_some());

    let attempt = storage
        .ledger
        .list(AttemptQuery {
            kind: Some("web".to_string()),
            ..Default::default()
        })
        .unwrap()
        .pop()
        .unwrap();
    assert!(attempt.is_complete());
    assert_eq!(attempt.success, Some(false));
    let error = attempt.error.unwrap();
    assert!(error.contains("upstream refused"));
    assert!(error.contains("stuck"));
}

#[tokio::test]
async fn test_tick_deadline_bounds_the_whole_tick() {
    let storage = storage();
    let mut recorder = Recorder::new(&storage, Arc::new(StaticLoad::new(5.0, 0.0))).unwrap();
    recorder.register(Arc::new(StuckProbe));
    recorder.register(Arc::new(StuckProbe));
    recorder.settings().put("tick.deadline", "100ms").unwrap();

    let started = std::time::Instant::now();
    let report = recorder.tick("web").await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!report.success());
    assert!(report.slot.is_none());
    assert!(report.probes.iter().all(|p| !p.ok));
}

// =============================================================================
// Durable tiers
// =============================================================================

#[tokio::test]
async fn test_flush_is_idempotent_and_archive_is_deduplicated() {
    let storage = storage();
    let mut recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
    recorder.set_archive_selector(ArchiveSelector::EveryNth(2));
    for _ in 0..4 {
        assert!(recorder.tick("db").await.success());
    }

    let first = recorder.flush();
    assert_eq!(first[0].samples, 4);
    assert_eq!(first[0].cursor, Some(3));
    let rows = storage.aggregates.count().unwrap();

    let second = recorder.flush();
    assert_eq!(second[0].samples, 0);
    assert_eq!(storage.aggregates.count().unwrap(), rows);

    let buckets = storage
        .aggregates
        .query(AggregateQuery {
            kind: Some("db".to_string()),
            dim_key: Some("latency_ms".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 4);

    assert_eq!(recorder.archive()[0].archived, 2);
    let again = recorder.archive();
    assert_eq!(again[0].archived, 0);
    assert_eq!(again[0].existing, 2);

    let archived = storage
        .archive
        .query(ArchiveQuery {
            kind: Some("db".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(archived.len(), 2);
    assert!(archived.iter().all(|r| r.tick % 2 == 0));
}

#[test]
fn test_retention_deletes_only_expired_rows() {
    let storage = storage();
    let settings = Settings::default();
    let now = Utc::now();
    let old = now - chrono::Duration::days(10);

    let ring = Ring::new("db", 8).unwrap();
    ring.write(0, SampleHeader::new(old).with_metric("v", 1.0), Vec::new(), 20);
    ring.write(1, SampleHeader::new(now).with_metric("v", 2.0), Vec::new(), 20);
    storage
        .aggregates
        .flush(&ring, settings.aggregate_bucket, now)
        .unwrap();
    let archive = storage
        .archive
        .archive(&ring, &ArchiveSelector::EveryNth(1), old - chrono::Duration::days(1), now)
        .unwrap();
    assert_eq!(archive.archived, 2);

    let closed = storage.ledger.record_start_at("db", 0, old).unwrap();
    storage
        .ledger
        .record_end_at(closed, true, None, old + chrono::Duration::seconds(1))
        .unwrap();
    storage.ledger.record_start_at("db", 1, old).unwrap();
    storage.ledger.record_start_at("db", 2, now).unwrap();

    let report = storage.retention.cleanup(&settings.retention, now).unwrap();
    assert_eq!(report.aggregates, 1);
    assert_eq!(report.archive_samples, 0);
    assert_eq!(report.attempts, 1);

    assert_eq!(storage.aggregates.count().unwrap(), 1);
    assert_eq!(storage.archive.count().unwrap(), 2);
    assert_eq!(storage.ledger.count().unwrap(), 2);
}

#[tokio::test]
async fn test_tick_numbers_continue_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ringwarden.db");

    {
        let storage = StorageBuilder::new(&path).build().unwrap();
        let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
        recorder.tick("db").await;
        recorder.tick("db").await;
        storage.ledger.record_start("db", 2).unwrap();
    }

    let storage = StorageBuilder::new(&path).build().unwrap();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
    let report = recorder.tick("db").await;
    assert_eq!(report.tick, 3);

    let attempts = storage.ledger.list(AttemptQuery::default()).unwrap();
    assert_eq!(attempts.len(), 4);
    assert!(attempts.iter().all(|a| a.is_complete()));
}

#[tokio::test]
async fn test_ticks_resume_past_flushed_samples_after_ledger_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ringwarden.db");

    {
        let storage = StorageBuilder::new(&path).build().unwrap();
        storage.state.put_setting("archive.every_n", "1").unwrap();
        let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
        for _ in 0..5 {
            recorder.tick("db").await;
        }
        assert_eq!(recorder.flush()[0].samples, 5);
        assert_eq!(recorder.archive()[0].archived, 5);

        let mut retention = Settings::default().retention;
        retention.ledger = Duration::from_millis(1);
        let pruned = storage
            .retention
            .cleanup(&retention, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(pruned.attempts, 5);
        assert!(storage.ledger.max_ticks().unwrap().is_empty());
    }

    let storage = StorageBuilder::new(&path).build().unwrap();
    let recorder = recorder_with(&storage, Arc::new(StaticLoad::new(5.0, 0.0)));
    let mut ticks = Vec::new();
    for _ in 0..3 {
        ticks.push(recorder.tick("db").await.tick);
    }
    assert_eq!(ticks, vec![5, 6, 7]);

    let flushed = recorder.flush();
    assert_eq!(flushed[0].samples, 3);
    assert_eq!(flushed[0].cursor, Some(7));

    let archived = recorder.archive();
    assert_eq!(archived[0].archived, 3);
    assert_eq!(archived[0].existing, 0);
    assert_eq!(storage.archive.count().unwrap(), 8);
}
