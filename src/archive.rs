//! Archive store: durable copies of selected raw ring samples.
//!
//! Rows are keyed by the originating sample `(kind, tick)` and inserted with
//! `ON CONFLICT DO NOTHING`, so re-running an archive pass over the same ring
//! never duplicates or mutates anything already archived.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duckdb::params;
use serde::Serialize;

use crate::ring::{DetailRow, Ring, RingEntry, SampleMeta};
use crate::storage::pool::DbPool;
use crate::storage::types::{from_micros, sample_id, to_micros};
use crate::storage::{ArchiveRecord, StorageError};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;

/// Which ring samples an archive pass copies.
#[derive(Clone)]
pub enum ArchiveSelector {
    /// Every sample whose tick is a multiple of N.
    EveryNth(u64),
    /// Samples the caller finds interesting.
    Predicate(Arc<dyn Fn(&RingEntry) -> bool + Send + Sync>),
}

impl ArchiveSelector {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&RingEntry) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, entry: &RingEntry) -> bool {
        match self {
            Self::EveryNth(n) => entry.tick % (*n).max(1) == 0,
            Self::Predicate(f) => f(entry),
        }
    }
}

impl fmt::Debug for ArchiveSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryNth(n) => write!(f, "EveryNth({n})"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Outcome of archiving one kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchiveReport {
    pub kind: String,
    /// Resident samples matching the selector.
    pub selected: usize,
    /// Newly archived samples.
    pub archived: usize,
    /// Selected samples already in the archive.
    pub existing: usize,
    /// Selected samples already past archive retention.
    pub expired: usize,
}

/// Filters for [`ArchiveStore::query`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveQuery {
    pub kind: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Append-only archive.
#[derive(Clone)]
pub struct ArchiveStore {
    pool: Arc<DbPool>,
}

impl fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveStore").finish_non_exhaustive()
    }
}

impl ArchiveStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Copy the samples of `ring` chosen by `selector`.
    ///
    /// Samples captured before `not_before` are left out; cleanup would
    /// delete them on its next pass anyway.
    pub fn archive(
        &self,
        ring: &Ring,
        selector: &ArchiveSelector,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ArchiveReport, StorageError> {
        let kind = ring.kind();
        let mut report = ArchiveReport {
            kind: kind.to_string(),
            ..Default::default()
        };

        let selected: Vec<RingEntry> = ring
            .snapshot()
            .into_iter()
            .filter(|e| selector.matches(e))
            .collect();
        report.selected = selected.len();
        if selected.is_empty() {
            return Ok(report);
        }

        let archived_at = to_micros(now);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut insert_sample = tx.prepare(
                "INSERT INTO archive_samples (kind, tick, sample_id, captured_at, archived_at, metrics, meta)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (kind, tick) DO NOTHING",
            )?;
            let mut insert_detail = tx.prepare(
                "INSERT INTO archive_details (kind, tick, rank, grp, item_key, value, attrs, captured_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (kind, tick, rank) DO NOTHING",
            )?;

            for entry in &selected {
                if entry.header.captured_at < not_before {
                    report.expired += 1;
                    continue;
                }
                let tick = entry.tick as i64;
                let captured_at = to_micros(entry.header.captured_at);
                let inserted = insert_sample.execute(params![
                    kind,
                    tick,
                    sample_id(kind, entry.tick),
                    captured_at,
                    archived_at,
                    serde_json::to_string(&entry.header.metrics)?,
                    serde_json::to_string(&entry.header.meta)?,
                ])?;
                if inserted == 0 {
                    report.existing += 1;
                    continue;
                }
                for (i, detail) in entry.details.iter().enumerate() {
                    let rank = if detail.rank > 0 {
                        detail.rank
                    } else {
                        i as u32 + 1
                    };
                    insert_detail.execute(params![
                        kind,
                        tick,
                        rank,
                        detail.group,
                        detail.key,
                        detail.value,
                        serde_json::to_string(&detail.attrs)?,
                        captured_at,
                    ])?;
                }
                report.archived += 1;
            }
        }
        tx.commit()?;

        if report.archived > 0 {
            tracing::debug!(
                kind,
                archived = report.archived,
                existing = report.existing,
                "Archived ring samples"
            );
        }
        Ok(report)
    }

    /// Archived samples (with details), newest first.
    pub fn query(&self, q: ArchiveQuery) -> Result<Vec<ArchiveRecord>, StorageError> {
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut sql = String::from(
            "SELECT kind, tick, sample_id, captured_at, archived_at, metrics, meta
             FROM archive_samples WHERE 1 = 1",
        );
        let mut params: Vec<Box<dyn duckdb::ToSql>> = Vec::new();

        if let Some(ref kind) = q.kind {
            sql.push_str(" AND kind = ?");
            params.push(Box::new(kind.clone()));
        }
        if let Some(start) = q.start {
            sql.push_str(" AND captured_at >= ?");
            params.push(Box::new(to_micros(start)));
        }
        if let Some(end) = q.end {
            sql.push_str(" AND captured_at <= ?");
            params.push(Box::new(to_micros(end)));
        }
        sql.push_str(&format!(" ORDER BY captured_at DESC, tick DESC LIMIT {limit}"));

        let conn = self.pool.get()?;
        let mut records = {
            let param_refs: Vec<&dyn duckdb::ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs.as_slice(), |row| {
                Ok(ArchiveRecord {
                    kind: row.get(0)?,
                    tick: row.get::<_, i64>(1)?.max(0) as u64,
                    sample_id: row.get(2)?,
                    captured_at: from_micros(row.get(3)?),
                    archived_at: from_micros(row.get(4)?),
                    metrics: parse_json(&row.get::<_, Option<String>>(5)?.unwrap_or_default()),
                    meta: parse_json::<SampleMeta>(&row.get::<_, Option<String>>(6)?.unwrap_or_default()),
                    details: Vec::new(),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut stmt = conn.prepare(
            "SELECT rank, grp, item_key, value, attrs FROM archive_details
             WHERE kind = ? AND tick = ? ORDER BY rank ASC",
        )?;
        for record in &mut records {
            let rows = stmt.query_map(params![record.kind, record.tick as i64], |row| {
                Ok(DetailRow {
                    rank: row.get::<_, i64>(0)?.max(0) as u32,
                    group: row.get(1)?,
                    key: row.get(2)?,
                    value: row.get(3)?,
                    attrs: parse_json(&row.get::<_, Option<String>>(4)?.unwrap_or_default()),
                })
            })?;
            record.details = rows.collect::<Result<Vec<_>, _>>()?;
        }
        Ok(records)
    }

    /// Archived sample count.
    pub fn count(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM archive_samples", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Highest archived tick per kind.
    pub fn max_ticks(&self) -> Result<HashMap<String, u64>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT kind, MAX(tick) FROM archive_samples GROUP BY kind")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?.max(0) as u64))
        })?;
        Ok(rows.collect::<Result<_, duckdb::Error>>()?)
    }
}

/// Parse a stored JSON column, falling back to the type's default.
fn parse_json<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    if s.is_empty() {
        return T::default();
    }
    serde_json::from_str(s).unwrap_or_else(|e| {
        tracing::debug!(error = %e, raw = s, "Failed to parse archived JSON, using default");
        T::default()
    })
}
