//! Tick orchestration.
//!
//! The [`Recorder`] owns the ring store, the durable-tier facades and the
//! governor, and exposes the short-lived entry points an external trigger
//! calls on independent schedules:
//!
//! - [`Recorder::tick`]: gate, probe, ring write, ledger finalization
//! - [`Recorder::flush`]: roll ring rows into aggregate buckets
//! - [`Recorder::archive`]: copy selected ring rows into the archive
//! - [`Recorder::cleanup`]: age-based deletion across durable tiers
//! - [`Recorder::reevaluate_mode`]: operating-mode state machine step
//!
//! A tick never fails: every probe outcome, skip reason and storage error is
//! captured in its [`TickReport`] and the ledger.

mod health;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::{AggregateStore, FlushReport};
use crate::archive::{ArchiveReport, ArchiveSelector, ArchiveStore};
use crate::config::{Settings, SettingsReader};
use crate::governor::{Governor, LoadSource, ModeEvaluation, SkipReason};
use crate::ledger::Ledger;
use crate::probe::{Probe, ProbeContext, ProbeError, Record};
use crate::retention::{CleanupReport, Retention};
use crate::ring::{DetailRow, Ring, RingEntry, RingStore, SampleHeader, SampleMeta};
use crate::state::StateService;
use crate::storage::{AttemptId, Mode, ModeState, StorageError, StorageHandles};

pub use health::{KindStatus, RingFootprint, StatusReport, StorageFootprint};

/// Ledger error recorded for a probe that never ran because the tick deadline
/// had already passed.
pub const DEADLINE_ERROR: &str = "abandoned: tick deadline exceeded";

/// Outcome of one probe within a tick.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub probe: String,
    pub ok: bool,
    pub records: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a tick ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// A gate fired; no probe was invoked.
    Skipped { reason: SkipReason },
    /// Probes ran. `success` is true only if every probe succeeded.
    Completed { success: bool },
}

/// Everything a single tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub kind: String,
    pub tick: u64,
    pub attempt_id: Option<AttemptId>,
    pub mode: Mode,
    pub outcome: TickOutcome,
    pub probes: Vec<ProbeOutcome>,
    /// Ring slot written, if any probe produced data.
    pub slot: Option<u32>,
    pub duration_ms: u64,
}

impl TickReport {
    pub fn skipped(&self) -> bool {
        matches!(self.outcome, TickOutcome::Skipped { .. })
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, TickOutcome::Completed { success: true })
    }
}

/// The pipeline: ring, durable tiers, governor and registered probes.
pub struct Recorder {
    rings: RingStore,
    ledger: Ledger,
    aggregates: AggregateStore,
    archive: ArchiveStore,
    retention: Retention,
    governor: Governor,
    settings: SettingsReader,
    probes: HashMap<String, Vec<Arc<dyn Probe>>>,
    archive_selector: Option<ArchiveSelector>,
    next_ticks: Mutex<HashMap<String, u64>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    last_runs: Mutex<HashMap<String, Instant>>,
    flush_lock: Mutex<()>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("kinds", &self.kinds())
            .finish_non_exhaustive()
    }
}

/// Next tick per kind: one past the highest tick in the ledger, the flush
/// cursors and the archive. Retention can empty the ledger of a kind while
/// its cursor and archived rows remain.
fn resume_ticks(storage: &StorageHandles) -> Result<HashMap<String, u64>, StorageError> {
    let mut next: HashMap<String, u64> = HashMap::new();
    for (kind, tick) in storage
        .ledger
        .max_ticks()?
        .into_iter()
        .chain(storage.aggregates.cursors()?)
        .chain(storage.archive.max_ticks()?)
    {
        let entry = next.entry(kind).or_default();
        *entry = (*entry).max(tick.saturating_add(1));
    }
    Ok(next)
}

impl Recorder {
    /// Build a recorder over opened storage.
    ///
    /// Closes attempts left open by a previous process and seeds every kind's
    /// tick counter past the highest tick any durable tier has seen.
    pub fn new(storage: &StorageHandles, load: Arc<dyn LoadSource>) -> Result<Self, StorageError> {
        let state: Arc<dyn StateService> = storage.state.clone();
        Self::with_state(storage, state, load)
    }

    /// Like [`Recorder::new`] but with a caller-supplied state service.
    pub fn with_state(
        storage: &StorageHandles,
        state: Arc<dyn StateService>,
        load: Arc<dyn LoadSource>,
    ) -> Result<Self, StorageError> {
        let ledger = storage.ledger.clone();

        let orphans = ledger.finalize_orphans(Utc::now())?;
        if orphans > 0 {
            tracing::warn!(orphans, "Finalized attempts left open by a previous run");
        }
        let next_ticks = resume_ticks(storage)?;

        Ok(Self {
            rings: RingStore::new(),
            governor: Governor::new(Arc::clone(&state), ledger.clone(), load),
            settings: SettingsReader::new(state),
            ledger,
            aggregates: storage.aggregates.clone(),
            archive: storage.archive.clone(),
            retention: storage.retention.clone(),
            probes: HashMap::new(),
            archive_selector: None,
            next_ticks: Mutex::new(next_ticks),
            in_flight: Mutex::new(HashMap::new()),
            last_runs: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
        })
    }

    /// Register a probe under its collection kind.
    pub fn register(&mut self, probe: Arc<dyn Probe>) {
        tracing::info!(probe = probe.name(), kind = probe.kind(), "Probe registered");
        self.probes
            .entry(probe.kind().to_string())
            .or_default()
            .push(probe);
    }

    /// Replace the default every-Nth archive selection.
    pub fn set_archive_selector(&mut self, selector: ArchiveSelector) {
        self.archive_selector = Some(selector);
    }

    pub fn rings(&self) -> &RingStore {
        &self.rings
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn aggregates(&self) -> &AggregateStore {
        &self.aggregates
    }

    pub fn archive_store(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn settings(&self) -> &SettingsReader {
        &self.settings
    }

    /// Kinds with registered probes or an allocated ring, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: BTreeSet<String> = self.probes.keys().cloned().collect();
        kinds.extend(self.rings.kinds());
        kinds.into_iter().collect()
    }

    /// Current mode, falling back to `normal` if the record is unreadable.
    fn current_mode(&self) -> Mode {
        self.governor
            .mode()
            .map(|m| m.mode)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Mode record unreadable, assuming normal");
                Mode::Normal
            })
    }

    fn next_tick(&self, kind: &str) -> u64 {
        let mut ticks = self.next_ticks.lock().unwrap_or_else(PoisonError::into_inner);
        let next = ticks.entry(kind.to_string()).or_insert(0);
        let tick = *next;
        *next += 1;
        tick
    }

    fn ring_for(&self, kind: &str, settings: &Settings) -> Option<Arc<Ring>> {
        match self.rings.ring(kind, settings.ring_capacity) {
            Ok(ring) => {
                if ring.capacity() != settings.ring_capacity {
                    tracing::info!(
                        kind,
                        from = ring.capacity(),
                        to = settings.ring_capacity,
                        "Ring capacity changed, reallocating"
                    );
                    if let Err(e) = ring.resize(settings.ring_capacity) {
                        tracing::warn!(kind, error = %e, "Ring resize skipped");
                    }
                }
                Some(ring)
            }
            Err(e) => {
                tracing::error!(kind, error = %e, "Ring unavailable");
                None
            }
        }
    }

    /// Run one tick of `kind`.
    ///
    /// Settings are read fresh. If a gate fires, a skip is recorded and no
    /// probe runs. Otherwise every registered probe runs in order, each
    /// bounded by its timeout and by what is left of the tick deadline; a
    /// probe that fails or times out does not stop the others. Whatever the
    /// successful probes produced is written to the ring, and the ledger
    /// attempt is always finalized.
    pub async fn tick(&self, kind: &str) -> TickReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let settings = self.settings.load();
        let mode = self.current_mode();
        let tick = self.next_tick(kind);

        if let Some(reason) = self.governor.check(kind, &settings, started_at) {
            tracing::debug!(kind, tick, gate = reason.gate(), reason = %reason, "Tick skipped");
            if let Err(e) = self.ledger.record_skip(kind, tick, &reason) {
                tracing::error!(kind, tick, error = %e, "Failed to record skip");
            }
            return TickReport {
                kind: kind.to_string(),
                tick,
                attempt_id: None,
                mode,
                outcome: TickOutcome::Skipped { reason },
                probes: Vec::new(),
                slot: None,
                duration_ms: clock.elapsed().as_millis() as u64,
            };
        }

        let attempt_id = self
            .ledger
            .record_start(kind, tick)
            .inspect_err(|e| tracing::error!(kind, tick, error = %e, "Failed to record attempt start"))
            .ok();

        let probes = self.probes.get(kind).map(Vec::as_slice).unwrap_or_default();
        let deadline = clock + settings.tick_deadline;
        let mut outcomes = Vec::with_capacity(probes.len());
        let mut metrics = Vec::new();
        let mut details = Vec::new();

        for probe in probes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(kind, tick, probe = probe.name(), "Tick deadline passed, probe abandoned");
                outcomes.push(ProbeOutcome {
                    probe: probe.name().to_string(),
                    ok: false,
                    records: 0,
                    elapsed_ms: 0,
                    error: Some(DEADLINE_ERROR.to_string()),
                });
                continue;
            }

            let budget = probe.timeout().unwrap_or(settings.probe_timeout).min(remaining);
            let ctx = ProbeContext {
                kind: kind.to_string(),
                tick,
                mode,
                timeout: budget,
            };
            let probe_clock = Instant::now();
            let result = run_probe(Arc::clone(probe), ctx, budget).await;
            let elapsed_ms = probe_clock.elapsed().as_millis() as u64;

            match result {
                Ok(records) => {
                    outcomes.push(ProbeOutcome {
                        probe: probe.name().to_string(),
                        ok: true,
                        records: records.len(),
                        elapsed_ms,
                        error: None,
                    });
                    for record in records {
                        match record {
                            Record::Metric { name, value } => metrics.push((name, value)),
                            Record::Detail(row) => details.push(row),
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(kind, tick, probe = probe.name(), error = %e, "Probe failed");
                    outcomes.push(ProbeOutcome {
                        probe: probe.name().to_string(),
                        ok: false,
                        records: 0,
                        elapsed_ms,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let probes_ok = outcomes.iter().filter(|o| o.ok).count() as u32;
        let probes_failed = outcomes.len() as u32 - probes_ok;
        let success = !outcomes.is_empty() && probes_failed == 0;

        let mut slot = None;
        if probes_ok > 0
            && let Some(ring) = self.ring_for(kind, &settings)
        {
            let meta = SampleMeta {
                mode,
                probes_ok,
                probes_failed,
                duration_ms: clock.elapsed().as_millis() as u64,
            };
            let header = metrics
                .into_iter()
                .fold(SampleHeader::new(started_at).with_meta(meta), |h, (name, value)| {
                    h.with_metric(name, value)
                });
            let max_details = settings.ring_max_details as usize;
            let receipt = ring.write(tick, header, rank_details(details, max_details), max_details);
            tracing::debug!(kind, tick, slot = receipt.slot_id, "Sample written");
            slot = Some(receipt.slot_id);
        }

        let error = if outcomes.is_empty() {
            Some(format!("no probes registered for kind '{kind}'"))
        } else {
            let failures: Vec<String> = outcomes
                .iter()
                .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.probe, e)))
                .collect();
            (!failures.is_empty()).then(|| failures.join("; "))
        };

        if let Some(id) = attempt_id
            && let Err(e) = self.ledger.record_end(id, success, error.as_deref())
        {
            tracing::error!(kind, tick, attempt = id, error = %e, "Failed to finalize attempt");
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        tracing::debug!(kind, tick, success, probes_ok, probes_failed, duration_ms, "Tick finished");

        TickReport {
            kind: kind.to_string(),
            tick,
            attempt_id,
            mode,
            outcome: TickOutcome::Completed { success },
            probes: outcomes,
            slot,
            duration_ms,
        }
    }

    /// Run a tick unless one for the same kind is already in flight.
    pub async fn try_tick(&self, kind: &str) -> Option<TickReport> {
        let lock = {
            let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(kind.to_string()).or_default())
        };
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(kind, "Tick already in flight, trigger dropped");
            return None;
        };
        Some(self.tick(kind).await)
    }

    /// Run a tick if the current mode's sample interval has elapsed since the
    /// last one for `kind`.
    pub async fn tick_if_due(&self, kind: &str) -> Option<TickReport> {
        let settings = self.settings.load();
        let interval = settings.profile(self.current_mode()).sample_interval;
        if !self.claim_run(&format!("tick:{kind}"), interval) {
            return None;
        }
        self.try_tick(kind).await
    }

    /// Run a flush if the current mode's flush interval has elapsed.
    pub fn flush_if_due(&self) -> Option<Vec<FlushReport>> {
        let settings = self.settings.load();
        let interval = settings.profile(self.current_mode()).flush_interval;
        self.claim_run("flush", interval).then(|| self.flush())
    }

    fn claim_run(&self, job: &str, interval: Duration) -> bool {
        let now = Instant::now();
        let mut runs = self.last_runs.lock().unwrap_or_else(PoisonError::into_inner);
        match runs.get(job) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                runs.insert(job.to_string(), now);
                true
            }
        }
    }

    /// Roll every ring's unflushed rows into aggregate buckets.
    ///
    /// A failure on one kind is logged and does not stop the others.
    pub fn flush(&self) -> Vec<FlushReport> {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let settings = self.settings.load();
        let now = Utc::now();

        self.rings
            .rings()
            .iter()
            .filter_map(|ring| {
                self.aggregates
                    .flush(ring, settings.aggregate_bucket, now)
                    .inspect_err(|e| tracing::error!(kind = ring.kind(), error = %e, "Flush failed"))
                    .ok()
            })
            .collect()
    }

    /// Copy selected ring rows into the archive.
    ///
    /// Rows already older than the archive retention window are not copied.
    pub fn archive(&self) -> Vec<ArchiveReport> {
        let settings = self.settings.load();
        let now = Utc::now();
        let not_before = since(now, settings.retention.archive);
        let default_selector;
        let selector = match &self.archive_selector {
            Some(selector) => selector,
            None => {
                default_selector = ArchiveSelector::EveryNth(settings.archive_every_n);
                &default_selector
            }
        };

        self.rings
            .rings()
            .iter()
            .filter_map(|ring| {
                self.archive
                    .archive(ring, selector, not_before, now)
                    .inspect_err(|e| tracing::error!(kind = ring.kind(), error = %e, "Archive failed"))
                    .ok()
            })
            .collect()
    }

    /// Delete durable rows older than each tier's retention window.
    pub fn cleanup(&self) -> Result<CleanupReport, StorageError> {
        let settings = self.settings.load();
        self.retention.cleanup(&settings.retention, Utc::now())
    }

    /// One step of the operating-mode state machine.
    pub fn reevaluate_mode(&self) -> Result<ModeEvaluation, StorageError> {
        let settings = self.settings.load();
        self.governor.reevaluate_mode(&settings, Utc::now())
    }

    /// Manual mode override.
    pub fn set_mode(&self, mode: Mode, reason: &str) -> Result<ModeState, StorageError> {
        self.governor.set_mode(mode, reason)
    }

    /// Resident ring rows of `kind` captured within `range` of now.
    ///
    /// `range` defaults to the current mode's real-time window.
    pub fn read_ring(&self, kind: &str, range: Option<Duration>) -> Vec<RingEntry> {
        let Some(ring) = self.rings.get(kind) else {
            return Vec::new();
        };
        let range = range.unwrap_or_else(|| {
            self.settings
                .load()
                .profile(self.current_mode())
                .realtime_window
        });
        let now = Utc::now();
        ring.read(since(now, range), now)
    }
}

/// Run a probe on its own task so a panic is contained, bounded by `budget`.
async fn run_probe(
    probe: Arc<dyn Probe>,
    ctx: ProbeContext,
    budget: Duration,
) -> Result<Vec<Record>, ProbeError> {
    let mut handle = tokio::spawn(async move { probe.collect(&ctx).await });
    match tokio::time::timeout(budget, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ProbeError::Failed(format!("probe task: {join}"))),
        Err(_) => {
            handle.abort();
            Err(ProbeError::Timeout(budget))
        }
    }
}

/// Sort by value descending, number the rows 1..K and keep the top `max`.
fn rank_details(mut details: Vec<DetailRow>, max: usize) -> Vec<DetailRow> {
    details.sort_by(|a, b| b.value.total_cmp(&a.value));
    details.truncate(max);
    for (i, row) in details.iter_mut().enumerate() {
        row.rank = i as u32 + 1;
    }
    details
}

/// `now - d`, saturating at the Unix epoch.
pub(crate) fn since(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Age of `at` relative to `now`, zero for timestamps in the future.
pub(crate) fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::governor::StaticLoad;
    use crate::storage::StorageBuilder;

    struct FixedProbe {
        name: String,
        kind: String,
        records: Vec<Record>,
    }

    #[async_trait::async_trait]
    impl Probe for FixedProbe {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> &str {
            &self.kind
        }
        async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
            Ok(self.records.clone())
        }
    }

    struct FailingProbe;

    #[async_trait::async_trait]
    impl Probe for FailingProbe {
        fn name(&self) -> &str {
            "broken"
        }
        fn kind(&self) -> &str {
            "tcp"
        }
        async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
            Err(ProbeError::Failed("boom".to_string()))
        }
    }

    struct SlowProbe {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Probe for SlowProbe {
        fn name(&self) -> &str {
            "slow"
        }
        fn kind(&self) -> &str {
            "tcp"
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }
        async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct PanickingProbe;

    #[async_trait::async_trait]
    impl Probe for PanickingProbe {
        fn name(&self) -> &str {
            "panicky"
        }
        fn kind(&self) -> &str {
            "tcp"
        }
        async fn collect(&self, _ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
            panic!("probe bug");
        }
    }

    fn fixed(name: &str) -> Arc<dyn Probe> {
        Arc::new(FixedProbe {
            name: name.to_string(),
            kind: "tcp".to_string(),
            records: vec![
                Record::metric(format!("{name}.up"), 1.0),
                Record::Detail(DetailRow::new(name, "a", 5.0)),
                Record::Detail(DetailRow::new(name, "b", 9.0)),
                Record::Detail(DetailRow::new(name, "c", 1.0)),
            ],
        })
    }

    fn recorder() -> (Recorder, StorageHandles) {
        let storage = StorageBuilder::in_memory().build().unwrap();
        let recorder = Recorder::new(&storage, Arc::new(StaticLoad::new(10.0, 0.0))).unwrap();
        (recorder, storage)
    }

    #[tokio::test]
    async fn test_tick_writes_ring_and_ledger() {
        let (mut recorder, storage) = recorder();
        recorder.register(fixed("core"));

        let report = recorder.tick("tcp").await;
        assert!(report.success());
        assert_eq!(report.tick, 0);
        assert_eq!(report.slot, Some(0));

        let entry = recorder.rings().get("tcp").unwrap().get_tick(0).unwrap();
        assert_eq!(entry.header.metrics["core.up"], 1.0);
        assert_eq!(entry.header.meta.probes_ok, 1);
        let ranked: Vec<(&str, u32)> = entry
            .details
            .iter()
            .map(|d| (d.key.as_str(), d.rank))
            .collect();
        assert_eq!(ranked, vec![("b", 1), ("a", 2), ("c", 3)]);

        let attempt = storage.ledger.get(report.attempt_id.unwrap()).unwrap().unwrap();
        assert!(attempt.is_complete());
        assert_eq!(attempt.success, Some(true));
    }

    #[tokio::test]
    async fn test_details_truncated_to_setting() {
        let (mut recorder, _storage) = recorder();
        recorder.settings().put("ring.max_details", "2").unwrap();
        recorder.register(fixed("core"));

        recorder.tick("tcp").await;
        let entry = recorder.rings().get("tcp").unwrap().get_tick(0).unwrap();
        assert_eq!(entry.details.len(), 2);
        assert_eq!(entry.details[0].key, "b");
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_abort_tick() {
        let (mut recorder, storage) = recorder();
        recorder.register(Arc::new(FailingProbe));
        recorder.register(fixed("core"));

        let report = recorder.tick("tcp").await;
        assert!(!report.success());
        assert!(report.slot.is_some());
        assert_eq!(report.probes.iter().filter(|p| p.ok).count(), 1);

        let attempt = storage.ledger.get(report.attempt_id.unwrap()).unwrap().unwrap();
        assert_eq!(attempt.success, Some(false));
        assert!(attempt.error.unwrap().contains("broken: probe failed: boom"));
    }

    #[tokio::test]
    async fn test_probe_timeout_and_panic_are_failures() {
        let (mut recorder, storage) = recorder();
        recorder.register(Arc::new(SlowProbe {
            calls: AtomicUsize::new(0),
        }));
        recorder.register(Arc::new(PanickingProbe));
        recorder.register(fixed("core"));

        let report = recorder.tick("tcp").await;
        assert!(!report.success());
        assert!(report.duration_ms < 5_000);
        let errors: Vec<&str> = report
            .probes
            .iter()
            .filter_map(|p| p.error.as_deref())
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("timed out"));

        let attempt = storage.ledger.get(report.attempt_id.unwrap()).unwrap().unwrap();
        assert!(attempt.is_complete());
    }

    #[tokio::test]
    async fn test_tick_deadline_abandons_remaining_probes() {
        let (mut recorder, storage) = recorder();
        recorder.settings().put("tick.deadline", "40ms").unwrap();
        let slow = Arc::new(SlowProbe {
            calls: AtomicUsize::new(0),
        });
        recorder.register(slow.clone());
        recorder.register(fixed("core"));

        let report = recorder.tick("tcp").await;
        assert_eq!(report.probes[1].error.as_deref(), Some(DEADLINE_ERROR));
        assert_eq!(report.slot, None);

        let attempt = storage.ledger.get(report.attempt_id.unwrap()).unwrap().unwrap();
        assert!(attempt.is_complete());
        assert_eq!(attempt.success, Some(false));
    }

    #[tokio::test]
    async fn test_disabled_kind_is_skipped() {
        let (mut recorder, storage) = recorder();
        recorder.register(fixed("core"));
        recorder.settings().put("collection.tcp.enabled", "false").unwrap();

        let report = recorder.tick("tcp").await;
        assert!(report.skipped());
        assert!(recorder.rings().get("tcp").is_none());

        let attempts = storage.ledger.list(Default::default()).unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].skipped);
        assert!(matches!(
            attempts[0].skip_reason,
            Some(SkipReason::Disabled { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_probes_completes_failed() {
        let (recorder, storage) = recorder();
        let report = recorder.tick("ghost").await;
        assert!(!report.success());
        let attempt = storage.ledger.get(report.attempt_id.unwrap()).unwrap().unwrap();
        assert!(attempt.error.unwrap().contains("no probes registered"));
    }

    #[tokio::test]
    async fn test_tick_numbering_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticks.db");
        {
            let storage = StorageBuilder::new(&path).build().unwrap();
            let mut recorder =
                Recorder::new(&storage, Arc::new(StaticLoad::new(0.0, 0.0))).unwrap();
            recorder.register(fixed("core"));
            recorder.tick("tcp").await;
            recorder.tick("tcp").await;
            storage.ledger.record_start("tcp", 2).unwrap();
        }

        let storage = StorageBuilder::new(&path).build().unwrap();
        let recorder = Recorder::new(&storage, Arc::new(StaticLoad::new(0.0, 0.0))).unwrap();
        let report = recorder.tick("tcp").await;
        assert_eq!(report.tick, 3);
        let orphan = storage
            .ledger
            .list(Default::default())
            .unwrap()
            .into_iter()
            .find(|a| a.tick == 2)
            .unwrap();
        assert_eq!(orphan.error.as_deref(), Some(crate::ledger::ABANDONED_ERROR));
    }

    #[tokio::test]
    async fn test_capacity_setting_reallocates_ring() {
        let (mut recorder, _storage) = recorder();
        recorder.settings().put("ring.capacity", "8").unwrap();
        recorder.register(fixed("core"));
        recorder.tick("tcp").await;
        assert_eq!(recorder.rings().get("tcp").unwrap().capacity(), 8);

        recorder.settings().put("ring.capacity", "16").unwrap();
        recorder.tick("tcp").await;
        let ring = recorder.rings().get("tcp").unwrap();
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.occupied(), 1);
    }

    #[tokio::test]
    async fn test_flush_and_archive_cover_all_rings() {
        let (mut recorder, storage) = recorder();
        recorder.settings().put("archive.every_n", "2").unwrap();
        recorder.register(fixed("core"));
        for _ in 0..4 {
            recorder.tick("tcp").await;
        }

        let flushed = recorder.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].samples, 4);
        assert_eq!(recorder.flush()[0].samples, 0);

        let archived = recorder.archive();
        assert_eq!(archived[0].archived, 2);
        assert_eq!(storage.archive.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_tick_if_due_respects_interval() {
        let (mut recorder, _storage) = recorder();
        recorder.register(fixed("core"));
        assert!(recorder.tick_if_due("tcp").await.is_some());
        assert!(recorder.tick_if_due("tcp").await.is_none());
    }

    #[tokio::test]
    async fn test_read_ring_defaults_to_realtime_window() {
        let (mut recorder, _storage) = recorder();
        recorder.register(fixed("core"));
        recorder.tick("tcp").await;
        assert_eq!(recorder.read_ring("tcp", None).len(), 1);
        assert!(recorder.read_ring("missing", None).is_empty());
    }

    #[test]
    fn test_rank_details_orders_descending() {
        let rows = vec![
            DetailRow::new("g", "low", 1.0),
            DetailRow::new("g", "high", 3.0),
            DetailRow::new("g", "mid", 2.0),
        ];
        let ranked = rank_details(rows, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!((ranked[0].key.as_str(), ranked[0].rank), ("high", 1));
        assert_eq!((ranked[1].key.as_str(), ranked[1].rank), ("mid", 2));
    }
}
