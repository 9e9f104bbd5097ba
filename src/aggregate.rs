//! Aggregation engine: rolls ring samples into durable time buckets.
//!
//! Each kind has a monotonic "last flushed tick" cursor in `flush_cursors`.
//! A flush reads the resident samples past the cursor, groups them by
//! `(bucket, dimensional key)`, and merges the partial statistics into
//! `aggregates` with an accumulating upsert. The merge and the cursor move
//! commit in one transaction, so re-flushing an unchanged ring adds nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duckdb::{OptionalExt, params};
use serde::Serialize;

use crate::ring::{Ring, RingEntry};
use crate::storage::pool::DbPool;
use crate::storage::types::{from_micros, to_micros};
use crate::storage::{AggregateBucket, StorageError};

const DEFAULT_LIMIT: u32 = 1_000;
const MAX_LIMIT: u32 = 10_000;

/// Outcome of flushing one kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    pub kind: String,
    /// Samples merged by this flush.
    pub samples: usize,
    /// Distinct `(bucket, key)` rows touched.
    pub buckets: usize,
    /// Cursor after the flush.
    pub cursor: Option<u64>,
    /// Samples overwritten in the ring before any flush saw them.
    pub lost: u64,
}

/// Filters for [`AggregateStore::query`].
#[derive(Debug, Clone, Default)]
pub struct AggregateQuery {
    pub kind: Option<String>,
    pub dim_key: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Partial {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Partial {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Durable rollups.
#[derive(Clone)]
pub struct AggregateStore {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore").finish_non_exhaustive()
    }
}

impl AggregateStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Last flushed tick for `kind`.
    pub fn cursor(&self, kind: &str) -> Result<Option<u64>, StorageError> {
        let conn = self.pool.get()?;
        let tick: Option<i64> = conn
            .query_row(
                "SELECT last_flushed_tick FROM flush_cursors WHERE kind = ?",
                [kind],
                |r| r.get(0),
            )
            .optional()?;
        Ok(tick.map(|t| t.max(0) as u64))
    }

    /// Last flushed tick of every kind that has flushed.
    pub fn cursors(&self) -> Result<HashMap<String, u64>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT kind, last_flushed_tick FROM flush_cursors")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?.max(0) as u64))
        })?;
        Ok(rows.collect::<Result<_, duckdb::Error>>()?)
    }

    /// Merge every resident sample of `ring` past the cursor.
    pub fn flush(
        &self,
        ring: &Ring,
        bucket: Duration,
        now: DateTime<Utc>,
    ) -> Result<FlushReport, StorageError> {
        let kind = ring.kind();
        let bucket_us = i64::try_from(bucket.as_micros())
            .ok()
            .filter(|us| *us > 0)
            .ok_or_else(|| StorageError::InvalidData(format!("bad bucket width {bucket:?}")))?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let cursor: Option<u64> = tx
            .query_row(
                "SELECT last_flushed_tick FROM flush_cursors WHERE kind = ?",
                [kind],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .map(|t| t.max(0) as u64);

        let entries = ring.entries_after(cursor);
        let Some(last_tick) = entries.last().map(|e| e.tick) else {
            tx.commit()?;
            return Ok(FlushReport {
                kind: kind.to_string(),
                cursor,
                lost: take_lost(ring),
                ..Default::default()
            });
        };

        let partials = group(&entries, bucket_us);
        let updated_at = to_micros(now);
        {
            let mut upsert = tx.prepare(
                "INSERT INTO aggregates
                    (kind, bucket_start, bucket_end, dim_key, sample_count, sum_value, min_value, max_value, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (kind, bucket_start, dim_key) DO UPDATE SET
                     sample_count = aggregates.sample_count + EXCLUDED.sample_count,
                     sum_value = aggregates.sum_value + EXCLUDED.sum_value,
                     min_value = least(aggregates.min_value, EXCLUDED.min_value),
                     max_value = greatest(aggregates.max_value, EXCLUDED.max_value),
                     updated_at = EXCLUDED.updated_at",
            )?;
            for ((bucket_start, dim_key), p) in &partials {
                upsert.execute(params![
                    kind,
                    bucket_start,
                    bucket_start + bucket_us,
                    dim_key,
                    p.count as i64,
                    p.sum,
                    p.min,
                    p.max,
                    updated_at,
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO flush_cursors (kind, last_flushed_tick, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (kind) DO UPDATE SET
                 last_flushed_tick = greatest(flush_cursors.last_flushed_tick, EXCLUDED.last_flushed_tick),
                 updated_at = EXCLUDED.updated_at",
            params![kind, last_tick as i64, updated_at],
        )?;
        tx.commit()?;
        ring.mark_flushed(last_tick);
        let lost = take_lost(ring);

        tracing::debug!(
            kind,
            samples = entries.len(),
            buckets = partials.len(),
            cursor = last_tick,
            "Flushed ring into aggregates"
        );

        Ok(FlushReport {
            kind: kind.to_string(),
            samples: entries.len(),
            buckets: partials.len(),
            cursor: Some(last_tick),
            lost,
        })
    }

    /// Buckets matching `q`, ordered by bucket start then key.
    pub fn query(&self, q: AggregateQuery) -> Result<Vec<AggregateBucket>, StorageError> {
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut sql = String::from(
            "SELECT kind, bucket_start, bucket_end, dim_key, sample_count, sum_value, min_value, max_value
             FROM aggregates WHERE 1 = 1",
        );
        let mut params: Vec<Box<dyn duckdb::ToSql>> = Vec::new();

        if let Some(ref kind) = q.kind {
            sql.push_str(" AND kind = ?");
            params.push(Box::new(kind.clone()));
        }
        if let Some(ref key) = q.dim_key {
            sql.push_str(" AND dim_key = ?");
            params.push(Box::new(key.clone()));
        }
        if let Some(start) = q.start {
            sql.push_str(" AND bucket_end > ?");
            params.push(Box::new(to_micros(start)));
        }
        if let Some(end) = q.end {
            sql.push_str(" AND bucket_start <= ?");
            params.push(Box::new(to_micros(end)));
        }
        sql.push_str(&format!(
            " ORDER BY bucket_start ASC, kind ASC, dim_key ASC LIMIT {limit}"
        ));

        let conn = self.pool.get()?;
        let param_refs: Vec<&dyn duckdb::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(AggregateBucket {
                kind: row.get(0)?,
                bucket_start: from_micros(row.get(1)?),
                bucket_end: from_micros(row.get(2)?),
                dim_key: row.get(3)?,
                count: row.get::<_, i64>(4)?.max(0) as u64,
                sum: row.get(5)?,
                min: row.get(6)?,
                max: row.get(7)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    /// Total rows.
    pub fn count(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM aggregates", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }
}

/// Dimensional key of a detail row: `<group>/<key>`.
pub fn detail_key(group: &str, key: &str) -> String {
    format!("{group}/{key}")
}

/// Group header metrics (keyed by metric name) and detail rows (keyed by
/// [`detail_key`]) into per-bucket partials.
/// Claim the ring's overwrite count once a flush has committed, so a failed
/// flush leaves it for the next attempt.
fn take_lost(ring: &Ring) -> u64 {
    let lost = ring.take_lost();
    if lost > 0 {
        tracing::warn!(
            kind = ring.kind(),
            lost,
            capacity = ring.capacity(),
            "Ring samples were overwritten before flush; raise ring.capacity or flush more often"
        );
    }
    lost
}

fn group(entries: &[RingEntry], bucket_us: i64) -> BTreeMap<(i64, String), Partial> {
    let mut partials: BTreeMap<(i64, String), Partial> = BTreeMap::new();
    let mut add = |bucket_start: i64, key: String, value: f64| {
        if !value.is_finite() {
            return;
        }
        partials
            .entry((bucket_start, key))
            .and_modify(|p| p.add(value))
            .or_insert_with(|| Partial::new(value));
    };

    for entry in entries {
        let bucket_start = to_micros(entry.header.captured_at).div_euclid(bucket_us) * bucket_us;
        for (name, value) in &entry.header.metrics {
            add(bucket_start, name.clone(), *value);
        }
        for detail in &entry.details {
            add(bucket_start, detail_key(&detail.group, &detail.key), detail.value);
        }
    }
    partials
}
