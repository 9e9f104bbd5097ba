//! Core probe trait and types.

use std::time::Duration;

use thiserror::Error;

use crate::ring::DetailRow;
use crate::storage::Mode;

/// Errors a probe invocation can end with.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe did not finish within its time budget.
    #[error("timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// Network I/O error.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Any other failure reported by the probe.
    #[error("probe failed: {0}")]
    Failed(String),
}

/// One value produced by a probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Headline value stored in the slot header.
    Metric { name: String, value: f64 },
    /// Breakdown row, ranked by the orchestrator before the ring write.
    Detail(DetailRow),
}

impl Record {
    pub fn metric(name: impl Into<String>, value: f64) -> Self {
        Self::Metric {
            name: name.into(),
            value,
        }
    }
}

/// What a probe knows about the tick it runs in.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub kind: String,
    pub tick: u64,
    pub mode: Mode,
    /// Time budget for this invocation; enforced by the orchestrator too.
    pub timeout: Duration,
}

/// A source of records for one collection kind.
///
/// A probe reports target-level failures (an unreachable host, a refused
/// connection) as data. `Err` means the probe itself could not produce a
/// snapshot.
#[async_trait::async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Unique name, used in logs and ledger errors.
    fn name(&self) -> &str;

    /// Collection kind this probe feeds.
    fn kind(&self) -> &str;

    /// Per-probe timeout; `None` uses the `probe.timeout` setting.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn collect(&self, ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError>;
}
