//! TCP connect probe.
//!
//! Measures TCP connection latency to a list of targets. Every target becomes
//! one detail row; the header gets reachable/unreachable counts and the worst
//! latency seen.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::probe::{Probe, ProbeContext, ProbeError, Record};
use crate::ring::DetailRow;

/// Default connection timeout (3 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Latency value indicating an unreachable target.
/// Using -1.0 to distinguish from valid 0ms latency.
const FAILURE_LATENCY_MS: f64 = -1.0;

fn default_enabled() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

/// One endpoint to connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Copied into the detail row's attributes.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TcpTarget {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tags: BTreeMap::new(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for a TCP connect probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpProbeConfig {
    /// Unique name for this probe instance.
    pub name: String,
    /// Enable this probe (default: true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-target connect timeout (default: 3s), capped by the tick's budget.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Whole-probe timeout; defaults to the `probe.timeout` setting.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub targets: Vec<TcpTarget>,
}

impl TcpProbeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: None,
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: TcpTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// TCP connect probe for one collection kind.
#[derive(Debug)]
pub struct TcpProbe {
    kind: String,
    config: TcpProbeConfig,
}

impl TcpProbe {
    pub fn new(kind: impl Into<String>, config: TcpProbeConfig) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }

    pub fn config(&self) -> &TcpProbeConfig {
        &self.config
    }
}

struct TargetResult {
    target: TcpTarget,
    latency_ms: f64,
    status: &'static str,
}

async fn connect(target: TcpTarget, limit: Duration) -> TargetResult {
    let addr = target.addr();
    let start = Instant::now();
    let (latency_ms, status) = match timeout(limit, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => (start.elapsed().as_secs_f64() * 1000.0, "ok"),
        Ok(Err(e)) => {
            tracing::debug!(target = %addr, error = %e, "TCP connect failed");
            (FAILURE_LATENCY_MS, "refused")
        }
        Err(_) => {
            tracing::debug!(target = %addr, timeout_ms = limit.as_millis() as u64, "TCP connect timed out");
            (FAILURE_LATENCY_MS, "timeout")
        }
    };
    TargetResult {
        target,
        latency_ms,
        status,
    }
}

#[async_trait::async_trait]
impl Probe for TcpProbe {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    async fn collect(&self, ctx: &ProbeContext) -> Result<Vec<Record>, ProbeError> {
        if self.config.targets.is_empty() {
            return Err(ProbeError::Failed(format!(
                "probe '{}' has no targets",
                self.config.name
            )));
        }

        let limit = self.config.connect_timeout.min(ctx.timeout);
        let mut set = JoinSet::new();
        for target in self.config.targets.iter().cloned() {
            set.spawn(connect(target, limit));
        }

        let mut results = Vec::with_capacity(self.config.targets.len());
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| ProbeError::Failed(format!("connect task: {e}")))?;
            results.push(result);
        }

        let reachable = results.iter().filter(|r| r.status == "ok").count();
        let max_latency = results
            .iter()
            .filter(|r| r.status == "ok")
            .map(|r| r.latency_ms)
            .fold(FAILURE_LATENCY_MS, f64::max);

        let name = &self.config.name;
        let mut records = vec![
            Record::metric(format!("{name}.reachable"), reachable as f64),
            Record::metric(
                format!("{name}.unreachable"),
                (results.len() - reachable) as f64,
            ),
            Record::metric(format!("{name}.max_latency_ms"), max_latency),
        ];
        records.extend(results.into_iter().map(|r| {
            let mut row = DetailRow::new(name.clone(), r.target.name.clone(), r.latency_ms)
                .with_attr("addr", r.target.addr())
                .with_attr("status", r.status);
            row.attrs.extend(r.target.tags);
            Record::Detail(row)
        }));

        tracing::debug!(probe = %name, tick = ctx.tick, reachable, "TCP probe finished");
        Ok(records)
    }
}
