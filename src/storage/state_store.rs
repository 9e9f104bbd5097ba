//! DuckDB-backed [`StateService`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use duckdb::{OptionalExt, params};

use crate::state::StateService;
use crate::storage::pool::DbPool;
use crate::storage::types::{from_micros, to_micros};
use crate::storage::{Mode, ModeState, StorageError};

/// The mode table holds exactly one row with this id.
const MODE_ROW_ID: i32 = 1;

/// Mode record and settings persisted in the shared database.
#[derive(Clone)]
pub struct StateStore {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn ensure_mode_row(conn: &duckdb::Connection) -> Result<(), StorageError> {
        let initial = ModeState::initial(Utc::now());
        conn.execute(
            "INSERT INTO operating_mode
                (id, mode, entered_at, reason, pending_mode, pending_count, version)
             VALUES (?, ?, ?, ?, NULL, 0, ?)
             ON CONFLICT (id) DO NOTHING",
            params![
                MODE_ROW_ID,
                initial.mode.as_ref(),
                to_micros(initial.entered_at),
                initial.reason,
                initial.version,
            ],
        )?;
        Ok(())
    }
}

impl StateService for StateStore {
    fn mode(&self) -> Result<ModeState, StorageError> {
        let conn = self.pool.get()?;
        Self::ensure_mode_row(&conn)?;

        let (mode, entered_at, reason, pending, pending_count, version): (
            String,
            i64,
            String,
            Option<String>,
            i64,
            i64,
        ) = conn.query_row(
            "SELECT mode, entered_at, reason, pending_mode, pending_count, version
             FROM operating_mode WHERE id = ?",
            [MODE_ROW_ID],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )?;

        let mode = Mode::from_str(&mode)
            .map_err(|_| StorageError::InvalidData(format!("unknown mode '{mode}'")))?;
        Ok(ModeState {
            mode,
            entered_at: from_micros(entered_at),
            reason,
            pending: pending.and_then(|p| Mode::from_str(&p).ok()),
            pending_count: pending_count.try_into().unwrap_or(0),
            version,
        })
    }

    fn compare_and_set_mode(
        &self,
        expected_version: i64,
        next: &ModeState,
    ) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        Self::ensure_mode_row(&conn)?;

        let updated = conn.execute(
            "UPDATE operating_mode
             SET mode = ?, entered_at = ?, reason = ?, pending_mode = ?, pending_count = ?, version = ?
             WHERE id = ? AND version = ?",
            params![
                next.mode.as_ref(),
                to_micros(next.entered_at),
                next.reason,
                next.pending.map(|p| p.as_ref().to_string()),
                i64::from(next.pending_count),
                expected_version + 1,
                MODE_ROW_ID,
                expected_version,
            ],
        )?;
        Ok(updated == 1)
    }

    fn setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()
        .map_err(StorageError::from)
    }

    fn settings(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        rows.collect::<Result<BTreeMap<_, _>, _>>()
            .map_err(StorageError::from)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
            params![key, value, to_micros(Utc::now())],
        )?;
        Ok(())
    }

    fn seed_setting(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO NOTHING",
            params![key, value, to_micros(Utc::now())],
        )?;
        Ok(inserted == 1)
    }
}
