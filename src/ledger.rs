//! Collection ledger.
//!
//! One row per tick attempt: opened by [`Ledger::record_start`], closed by
//! [`Ledger::record_end`], or written already closed by [`Ledger::record_skip`].
//! The circuit breaker, the mode machine and the health report read nothing
//! but this table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use duckdb::{OptionalExt, params};

use crate::governor::SkipReason;
use crate::storage::pool::DbPool;
use crate::storage::types::{from_micros, to_micros};
use crate::storage::{AttemptId, CollectionAttempt, StorageError};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;

/// Error recorded for attempts found open at startup.
pub const ABANDONED_ERROR: &str = "abandoned: process exited mid-tick";

/// `skip_gate` of a circuit-breaker trip.
const CIRCUIT_OPEN_GATE: &str = "circuit_open";

/// Filters for [`Ledger::list`].
#[derive(Debug, Clone, Default)]
pub struct AttemptQuery {
    pub kind: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub skipped: Option<bool>,
    pub limit: Option<u32>,
}

/// Ledger facade over the `collection_attempts` table.
#[derive(Clone)]
pub struct Ledger {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Open an attempt for `kind` at `tick`.
    pub fn record_start(&self, kind: &str, tick: u64) -> Result<AttemptId, StorageError> {
        self.record_start_at(kind, tick, Utc::now())
    }

    pub fn record_start_at(
        &self,
        kind: &str,
        tick: u64,
        started_at: DateTime<Utc>,
    ) -> Result<AttemptId, StorageError> {
        let conn = self.pool.get()?;
        let id = conn.query_row(
            "INSERT INTO collection_attempts (kind, tick, started_at, skipped)
             VALUES (?, ?, ?, false)
             RETURNING id",
            params![kind, tick_param(tick)?, to_micros(started_at)],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Close an attempt, computing its duration from the recorded start.
    ///
    /// Returns `false` if the attempt was already closed.
    pub fn record_end(
        &self,
        id: AttemptId,
        success: bool,
        error: Option<&str>,
    ) -> Result<bool, StorageError> {
        self.record_end_at(id, success, error, Utc::now())
    }

    pub fn record_end_at(
        &self,
        id: AttemptId,
        success: bool,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let started: Option<i64> = conn
            .query_row(
                "SELECT started_at FROM collection_attempts WHERE id = ?",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        let started = started.ok_or_else(|| StorageError::NotFound(format!("attempt {id}")))?;

        let completed = to_micros(completed_at);
        let duration_ms = (completed - started).max(0) / 1000;
        let updated = conn.execute(
            "UPDATE collection_attempts
             SET completed_at = ?, duration_ms = ?, success = ?, error = ?
             WHERE id = ? AND completed_at IS NULL",
            params![completed, duration_ms, success, error, id],
        )?;
        Ok(updated == 1)
    }

    /// Record a gated tick. No probe ran, so the row is closed immediately
    /// with zero duration.
    pub fn record_skip(
        &self,
        kind: &str,
        tick: u64,
        reason: &SkipReason,
    ) -> Result<AttemptId, StorageError> {
        self.record_skip_at(kind, tick, reason, Utc::now())
    }

    pub fn record_skip_at(
        &self,
        kind: &str,
        tick: u64,
        reason: &SkipReason,
        at: DateTime<Utc>,
    ) -> Result<AttemptId, StorageError> {
        let reason_json = serde_json::to_string(reason)?;
        let at = to_micros(at);
        let conn = self.pool.get()?;
        let id = conn.query_row(
            "INSERT INTO collection_attempts
                (kind, tick, started_at, completed_at, duration_ms, success, skipped, skip_reason, skip_gate)
             VALUES (?, ?, ?, ?, 0, NULL, true, ?, ?)
             RETURNING id",
            params![kind, tick_param(tick)?, at, at, reason_json, reason.gate()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Durations of successful, non-skipped attempts for `kind` started at or
    /// after `since`, oldest first.
    pub fn recent_durations(
        &self,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<u64>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT duration_ms FROM collection_attempts
             WHERE kind = ? AND started_at >= ? AND skipped = false AND success = true
               AND completed_at IS NOT NULL
             ORDER BY started_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![kind, to_micros(since)], |r| r.get::<_, i64>(0))?;
        rows.map(|r| r.map(|ms| ms.max(0) as u64))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Circuit-breaker trips since `since`, for one kind or across all kinds.
    pub fn trip_count(
        &self,
        kind: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let conn = self.pool.get()?;
        let count: i64 = match kind {
            Some(kind) => conn.query_row(
                "SELECT COUNT(*) FROM collection_attempts
                 WHERE kind = ? AND started_at >= ? AND skipped = true AND skip_gate = ?",
                params![kind, to_micros(since), CIRCUIT_OPEN_GATE],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM collection_attempts
                 WHERE started_at >= ? AND skipped = true AND skip_gate = ?",
                params![to_micros(since), CIRCUIT_OPEN_GATE],
                |r| r.get(0),
            )?,
        };
        Ok(count.try_into().unwrap_or(u32::MAX))
    }

    /// Trip counts per kind since `since`.
    pub fn trips_by_kind(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, u32>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM collection_attempts
             WHERE started_at >= ? AND skipped = true AND skip_gate = ?
             GROUP BY kind",
        )?;
        let rows = stmt.query_map(params![to_micros(since), CIRCUIT_OPEN_GATE], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut trips = BTreeMap::new();
        for row in rows {
            let (kind, count) = row?;
            trips.insert(kind, count.try_into().unwrap_or(u32::MAX));
        }
        Ok(trips)
    }

    /// Completion time of the latest successful attempt for `kind`.
    pub fn last_success(&self, kind: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let conn = self.pool.get()?;
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(completed_at) FROM collection_attempts
             WHERE kind = ? AND success = true AND skipped = false",
            [kind],
            |r| r.get(0),
        )?;
        Ok(ts.map(from_micros))
    }

    /// Latest successful completion per kind, for every kind with any attempt.
    /// Kinds that never succeeded map to `None`.
    pub fn last_successes(&self) -> Result<BTreeMap<String, Option<DateTime<Utc>>>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT kind,
                    MAX(CASE WHEN success = true AND skipped = false THEN completed_at END)
             FROM collection_attempts GROUP BY kind",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<i64>>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (kind, ts) = row?;
            out.insert(kind, ts.map(from_micros));
        }
        Ok(out)
    }

    /// Highest tick recorded per kind.
    pub fn max_ticks(&self) -> Result<HashMap<String, u64>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT kind, MAX(tick) FROM collection_attempts GROUP BY kind")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (kind, tick) = row?;
            out.insert(kind, tick.max(0) as u64);
        }
        Ok(out)
    }

    /// Close every attempt left open, e.g. by a crash mid-tick.
    pub fn finalize_orphans(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.pool.get()?;
        let closed = conn.execute(
            "UPDATE collection_attempts
             SET completed_at = ?,
                 duration_ms = greatest(CAST((? - started_at) / 1000 AS BIGINT), 0),
                 success = false,
                 error = ?
             WHERE completed_at IS NULL",
            params![to_micros(now), to_micros(now), ABANDONED_ERROR],
        )?;
        if closed > 0 {
            tracing::warn!(closed, "Finalized attempts left open by a previous run");
        }
        Ok(closed)
    }

    /// Single attempt by id.
    pub fn get(&self, id: AttemptId) -> Result<Option<CollectionAttempt>, StorageError> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {ATTEMPT_COLUMNS} FROM collection_attempts WHERE id = ?"),
            [id],
            map_attempt,
        )
        .optional()
        .map_err(StorageError::from)
    }

    /// Attempts matching `q`, newest first.
    pub fn list(&self, q: AttemptQuery) -> Result<Vec<CollectionAttempt>, StorageError> {
        let now = Utc::now();
        let start = q.start.unwrap_or_else(|| now - Duration::days(1));
        let end = q.end.unwrap_or(now);
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

        let mut sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM collection_attempts WHERE started_at >= ? AND started_at <= ?"
        );
        let mut params: Vec<Box<dyn duckdb::ToSql>> =
            vec![Box::new(to_micros(start)), Box::new(to_micros(end))];

        if let Some(ref kind) = q.kind {
            sql.push_str(" AND kind = ?");
            params.push(Box::new(kind.clone()));
        }
        if let Some(skipped) = q.skipped {
            sql.push_str(" AND skipped = ?");
            params.push(Box::new(skipped));
        }
        sql.push_str(&format!(" ORDER BY started_at DESC, id DESC LIMIT {limit}"));

        let conn = self.pool.get()?;
        let param_refs: Vec<&dyn duckdb::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), map_attempt)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Total rows in the ledger.
    pub fn count(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM collection_attempts", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }
}

const ATTEMPT_COLUMNS: &str = "id, kind, tick, started_at, completed_at, duration_ms, success, skipped, skip_reason, error";

fn map_attempt(row: &duckdb::Row<'_>) -> duckdb::Result<CollectionAttempt> {
    let skip_reason: Option<String> = row.get(8)?;
    Ok(CollectionAttempt {
        id: row.get(0)?,
        kind: row.get(1)?,
        tick: row.get::<_, i64>(2)?.max(0) as u64,
        started_at: from_micros(row.get(3)?),
        completed_at: row.get::<_, Option<i64>>(4)?.map(from_micros),
        duration_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms.max(0) as u64),
        success: row.get(6)?,
        skipped: row.get(7)?,
        skip_reason: skip_reason.and_then(|s| {
            serde_json::from_str(&s)
                .inspect_err(|e| tracing::debug!(error = %e, raw = s, "Unreadable skip reason"))
                .ok()
        }),
        error: row.get(9)?,
    })
}

fn tick_param(tick: u64) -> Result<i64, StorageError> {
    i64::try_from(tick).map_err(|_| StorageError::InvalidData(format!("tick {tick} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::storage::pool::MEMORY_PATH;

    fn ledger() -> Ledger {
        Ledger::new(DbPool::open(Path::new(MEMORY_PATH), 2).unwrap())
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    #[test]
    fn test_start_end_computes_duration() {
        let ledger = ledger();
        let t0 = Utc::now();

        let id = ledger.record_start_at("tcp", 1, t0).unwrap();
        let open = ledger.get(id).unwrap().unwrap();
        assert!(!open.is_complete());
        assert_eq!(open.success, None);

        assert!(ledger.record_end_at(id, true, None, t0 + ms(1500)).unwrap());
        let closed = ledger.get(id).unwrap().unwrap();
        assert!(closed.is_complete());
        assert_eq!(closed.duration_ms, Some(1500));
        assert_eq!(closed.success, Some(true));
        assert_eq!(closed.tick, 1);
    }

    #[test]
    fn test_end_is_applied_once() {
        let ledger = ledger();
        let t0 = Utc::now();
        let id = ledger.record_start_at("tcp", 1, t0).unwrap();

        assert!(ledger.record_end_at(id, false, Some("boom"), t0 + ms(10)).unwrap());
        assert!(!ledger.record_end_at(id, true, None, t0 + ms(20)).unwrap());

        let row = ledger.get(id).unwrap().unwrap();
        assert_eq!(row.success, Some(false));
        assert_eq!(row.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_end_unknown_attempt() {
        let ledger = ledger();
        assert!(matches!(
            ledger.record_end(999, true, None),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_skip_is_closed_with_structured_reason() {
        let ledger = ledger();
        let reason = SkipReason::LoadShed {
            threshold_pct: 70.0,
            observed_pct: 91.5,
        };
        let id = ledger.record_skip("tcp", 4, &reason).unwrap();

        let row = ledger.get(id).unwrap().unwrap();
        assert!(row.skipped);
        assert!(row.is_complete());
        assert_eq!(row.duration_ms, Some(0));
        assert_eq!(row.skip_reason, Some(reason));
    }

    #[test]
    fn test_recent_durations_only_successful_in_window() {
        let ledger = ledger();
        let now = Utc::now();
        let record = |offset_min: i64, dur: i64, ok: bool| {
            let start = now - Duration::minutes(offset_min);
            let id = ledger.record_start_at("tcp", 0, start).unwrap();
            ledger.record_end_at(id, ok, None, start + ms(dur)).unwrap();
        };

        record(30, 9000, true); // outside window
        record(10, 1500, true);
        record(8, 7000, false); // failed
        record(5, 1600, true);
        ledger
            .record_skip_at(
                "tcp",
                0,
                &SkipReason::Disabled {
                    scope: "tcp".to_string(),
                },
                now - Duration::minutes(4),
            )
            .unwrap();
        ledger.record_start_at("tcp", 0, now - Duration::minutes(1)).unwrap(); // open

        let durations = ledger
            .recent_durations("tcp", now - Duration::minutes(15))
            .unwrap();
        assert_eq!(durations, vec![1500, 1600]);
        assert!(ledger.recent_durations("disk", now - Duration::minutes(15)).unwrap().is_empty());
    }

    #[test]
    fn test_trip_count() {
        let ledger = ledger();
        let now = Utc::now();
        let open = SkipReason::CircuitOpen {
            threshold_ms: 1000,
            avg_ms: 1475.0,
            samples: 3,
        };
        let shed = SkipReason::LoadShed {
            threshold_pct: 70.0,
            observed_pct: 80.0,
        };

        ledger.record_skip_at("tcp", 1, &open, now - Duration::minutes(1)).unwrap();
        ledger.record_skip_at("tcp", 2, &open, now - Duration::minutes(2)).unwrap();
        ledger.record_skip_at("disk", 1, &open, now - Duration::minutes(3)).unwrap();
        ledger.record_skip_at("tcp", 3, &shed, now - Duration::minutes(1)).unwrap();
        ledger.record_skip_at("tcp", 0, &open, now - Duration::hours(1)).unwrap();

        let since = now - Duration::minutes(15);
        assert_eq!(ledger.trip_count(Some("tcp"), since).unwrap(), 2);
        assert_eq!(ledger.trip_count(None, since).unwrap(), 3);

        let by_kind = ledger.trips_by_kind(since).unwrap();
        assert_eq!(by_kind.get("tcp"), Some(&2));
        assert_eq!(by_kind.get("disk"), Some(&1));
    }

    #[test]
    fn test_trips_follow_skip_gate_column() {
        let pool = DbPool::open(Path::new(MEMORY_PATH), 2).unwrap();
        let ledger = Ledger::new(Arc::clone(&pool));
        let now = Utc::now();
        let shed = ledger
            .record_skip_at(
                "tcp",
                1,
                &SkipReason::LoadShed {
                    threshold_pct: 70.0,
                    observed_pct: 80.0,
                },
                now,
            )
            .unwrap();

        let conn = pool.get().unwrap();
        let gate: String = conn
            .query_row(
                "SELECT skip_gate FROM collection_attempts WHERE id = ?",
                [shed],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(gate, "load_shed");

        // Reason text laid out differently than serde writes it.
        conn.execute(
            "INSERT INTO collection_attempts
                (kind, tick, started_at, completed_at, duration_ms, skipped, skip_reason, skip_gate)
             VALUES ('tcp', 2, ?, ?, 0, true, '{ \"gate\" : \"circuit_open\" }', 'circuit_open')",
            params![to_micros(now), to_micros(now)],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO collection_attempts
                (kind, tick, started_at, completed_at, duration_ms, skipped, skip_reason, skip_gate)
             VALUES ('tcp', 3, ?, ?, 0, true, '{\"gate\":\"circuit_open\"}', 'disabled')",
            params![to_micros(now), to_micros(now)],
        )
        .unwrap();

        let since = now - Duration::minutes(1);
        assert_eq!(ledger.trip_count(Some("tcp"), since).unwrap(), 1);
        assert_eq!(ledger.trips_by_kind(since).unwrap().get("tcp"), Some(&1));
    }

    #[test]
    fn test_last_success_and_max_ticks() {
        let ledger = ledger();
        let t0 = Utc::now() - Duration::minutes(10);

        let a = ledger.record_start_at("tcp", 7, t0).unwrap();
        ledger.record_end_at(a, true, None, t0 + ms(100)).unwrap();
        let b = ledger.record_start_at("tcp", 8, t0 + Duration::minutes(1)).unwrap();
        ledger.record_end_at(b, false, Some("refused"), t0 + Duration::minutes(1)).unwrap();
        let c = ledger.record_start_at("disk", 3, t0).unwrap();
        ledger.record_end_at(c, false, None, t0).unwrap();

        let last = ledger.last_success("tcp").unwrap().unwrap();
        assert_eq!(to_micros(last), to_micros(t0 + ms(100)));
        assert!(ledger.last_success("disk").unwrap().is_none());

        let all = ledger.last_successes().unwrap();
        assert!(all["tcp"].is_some());
        assert!(all["disk"].is_none());

        let ticks = ledger.max_ticks().unwrap();
        assert_eq!(ticks["tcp"], 8);
        assert_eq!(ticks["disk"], 3);
    }

    #[test]
    fn test_finalize_orphans() {
        let ledger = ledger();
        let t0 = Utc::now() - Duration::seconds(5);
        let open = ledger.record_start_at("tcp", 1, t0).unwrap();
        let done = ledger.record_start_at("tcp", 2, t0).unwrap();
        ledger.record_end_at(done, true, None, t0 + ms(10)).unwrap();

        assert_eq!(ledger.finalize_orphans(t0 + ms(2500)).unwrap(), 1);
        assert_eq!(ledger.finalize_orphans(t0 + ms(2500)).unwrap(), 0);

        let row = ledger.get(open).unwrap().unwrap();
        assert!(row.is_complete());
        assert_eq!(row.success, Some(false));
        assert_eq!(row.duration_ms, Some(2500));
        assert_eq!(row.error.as_deref(), Some(ABANDONED_ERROR));
    }

    #[test]
    fn test_list_filters() {
        let ledger = ledger();
        let now = Utc::now();
        for tick in 0..5 {
            let id = ledger
                .record_start_at("tcp", tick, now - Duration::minutes(10 - tick as i64))
                .unwrap();
            ledger.record_end_at(id, true, None, now).unwrap();
        }
        ledger
            .record_skip_at(
                "disk",
                0,
                &SkipReason::Disabled {
                    scope: "global".to_string(),
                },
                now,
            )
            .unwrap();

        let tcp = ledger
            .list(AttemptQuery {
                kind: Some("tcp".to_string()),
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tcp.len(), 3);
        assert_eq!(tcp[0].tick, 4);

        let skipped = ledger
            .list(AttemptQuery {
                skipped: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].kind, "disk");
        assert_eq!(ledger.count().unwrap(), 6);
    }
}
