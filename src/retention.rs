//! Age-based cleanup of the durable tiers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RetentionSettings;
use crate::recorder::since;
use crate::storage::StorageError;
use crate::storage::pool::DbPool;
use crate::storage::types::to_micros;

/// Rows deleted per table by one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub archive_details: usize,
    pub archive_samples: usize,
    pub aggregates: usize,
    pub attempts: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.archive_details + self.archive_samples + self.aggregates + self.attempts
    }
}

/// Deletes rows strictly older than `now - retention`, per tier.
///
/// Every statement only touches rows past their cutoff, so a pass can run
/// alongside flush and archive: those only write rows inside the window.
#[derive(Clone)]
pub struct Retention {
    pool: Arc<DbPool>,
}

impl std::fmt::Debug for Retention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retention").finish_non_exhaustive()
    }
}

impl Retention {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Run one pass. Leaf tables go first (`archive_details` before
    /// `archive_samples`).
    pub fn cleanup(
        &self,
        policy: &RetentionSettings,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, StorageError> {
        let archive_cutoff = to_micros(since(now, policy.archive));
        let aggregate_cutoff = to_micros(since(now, policy.aggregates));
        let ledger_cutoff = to_micros(since(now, policy.ledger));

        let conn = self.pool.get()?;
        let report = CleanupReport {
            archive_details: conn.execute(
                "DELETE FROM archive_details WHERE captured_at < ?",
                [archive_cutoff],
            )?,
            archive_samples: conn.execute(
                "DELETE FROM archive_samples WHERE captured_at < ?",
                [archive_cutoff],
            )?,
            aggregates: conn.execute(
                "DELETE FROM aggregates WHERE bucket_start < ?",
                [aggregate_cutoff],
            )?,
            attempts: conn.execute(
                "DELETE FROM collection_attempts WHERE started_at < ? AND completed_at IS NOT NULL",
                [ledger_cutoff],
            )?,
        };

        if report.total() > 0 {
            tracing::info!(
                archive_details = report.archive_details,
                archive_samples = report.archive_samples,
                aggregates = report.aggregates,
                attempts = report.attempts,
                "Retention cleanup completed"
            );
        }
        Ok(report)
    }
}
