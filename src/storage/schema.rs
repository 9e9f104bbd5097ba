//! Database schema definitions.
//!
//! Ring contents are ephemeral and never reach the database; only the durable
//! tiers (aggregates, archive, ledger) and the control state live here.

use duckdb::Connection;

use crate::storage::StorageError;

/// Time-bucketed rollups keyed by `(kind, bucket_start, dim_key)`.
///
/// Counters accumulate within a bucket; `avg` is derived on read.
pub const AGGREGATES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS aggregates (
    kind          VARCHAR NOT NULL,
    bucket_start  BIGINT NOT NULL,
    bucket_end    BIGINT NOT NULL,
    dim_key       VARCHAR NOT NULL,
    sample_count  BIGINT NOT NULL,
    sum_value     DOUBLE NOT NULL,
    min_value     DOUBLE NOT NULL,
    max_value     DOUBLE NOT NULL,
    updated_at    BIGINT NOT NULL,
    PRIMARY KEY (kind, bucket_start, dim_key)
);
"#;

/// Monotonic "last flushed tick" cursor per collection kind.
pub const FLUSH_CURSORS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS flush_cursors (
    kind               VARCHAR PRIMARY KEY,
    last_flushed_tick  BIGINT NOT NULL,
    updated_at         BIGINT NOT NULL
);
"#;

/// Archived raw ring rows, keyed by originating sample (kind, tick).
///
/// `archive_details` is the leaf table and is always deleted first.
pub const ARCHIVE_TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS archive_samples (
    kind         VARCHAR NOT NULL,
    tick         BIGINT NOT NULL,
    sample_id    VARCHAR NOT NULL,
    captured_at  BIGINT NOT NULL,
    archived_at  BIGINT NOT NULL,
    metrics      VARCHAR DEFAULT '{}',
    meta         VARCHAR DEFAULT '{}',
    PRIMARY KEY (kind, tick)
);
CREATE TABLE IF NOT EXISTS archive_details (
    kind         VARCHAR NOT NULL,
    tick         BIGINT NOT NULL,
    rank         INTEGER NOT NULL,
    grp          VARCHAR NOT NULL,
    item_key     VARCHAR NOT NULL,
    value        DOUBLE NOT NULL,
    attrs        VARCHAR DEFAULT '{}',
    captured_at  BIGINT NOT NULL,
    PRIMARY KEY (kind, tick, rank)
);
"#;

/// Collection ledger: one row per tick attempt.
pub const COLLECTION_ATTEMPTS_TABLE_DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS collection_attempts_id_seq;
CREATE TABLE IF NOT EXISTS collection_attempts (
    id            BIGINT PRIMARY KEY DEFAULT NEXTVAL('collection_attempts_id_seq'),
    kind          VARCHAR NOT NULL,
    tick          BIGINT NOT NULL,
    started_at    BIGINT NOT NULL,
    completed_at  BIGINT,
    duration_ms   BIGINT,
    success       BOOLEAN,
    skipped       BOOLEAN NOT NULL DEFAULT false,
    skip_reason   VARCHAR,
    skip_gate     VARCHAR,
    error         VARCHAR
);
ALTER TABLE collection_attempts ADD COLUMN IF NOT EXISTS skip_gate VARCHAR;
"#;

/// Single-row operating mode record, updated by compare-and-set on `version`.
pub const OPERATING_MODE_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS operating_mode (
    id             INTEGER PRIMARY KEY,
    mode           VARCHAR NOT NULL,
    entered_at     BIGINT NOT NULL,
    reason         VARCHAR NOT NULL,
    pending_mode   VARCHAR,
    pending_count  INTEGER NOT NULL DEFAULT 0,
    version        BIGINT NOT NULL
);
"#;

/// Operator-tunable key/value settings.
pub const SETTINGS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key         VARCHAR PRIMARY KEY,
    value       VARCHAR NOT NULL,
    updated_at  BIGINT NOT NULL
);
"#;

/// Initialize the database schema.
///
/// Creates all necessary tables if they don't exist.
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(AGGREGATES_TABLE_DDL)?;
    conn.execute_batch(FLUSH_CURSORS_TABLE_DDL)?;
    conn.execute_batch(ARCHIVE_TABLES_DDL)?;
    conn.execute_batch(COLLECTION_ATTEMPTS_TABLE_DDL)?;
    conn.execute_batch(OPERATING_MODE_TABLE_DDL)?;
    conn.execute_batch(SETTINGS_TABLE_DDL)?;

    tracing::info!("Database schema initialized");
    Ok(())
}
