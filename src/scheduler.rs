//! Periodic trigger for the recorder's entry points.
//!
//! Every job fires on a fixed base cadence (or a cron expression). Tick and
//! flush jobs then consult the current mode's profile and only run when the
//! profile interval has elapsed, so a mode change retunes sampling without
//! rescheduling anything. A tick trigger that finds the previous tick of the
//! same kind still running is dropped.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::ConfigError;
use crate::recorder::Recorder;

/// How long shutdown waits for running jobs.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum interval between triggers.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The underlying job scheduler failed.
    #[error("job scheduler: {0}")]
    Scheduler(String),

    /// A cron expression did not parse.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

impl From<tokio_cron_scheduler::JobSchedulerError> for SchedulerError {
    fn from(e: tokio_cron_scheduler::JobSchedulerError) -> Self {
        Self::Scheduler(e.to_string())
    }
}

/// When a job fires.
///
/// In YAML a schedule is a single string: a duration (`"30s"`) or a 6-field
/// cron expression (`"0 0 3 * * *"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Fixed interval, at least [`MIN_INTERVAL`].
    Interval(Duration),
    /// `sec min hour day month weekday`
    Cron(String),
}

impl Schedule {
    /// Fixed cadence; anything below [`MIN_INTERVAL`] is raised to it.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL, requested = ?duration,
                "Interval is below the minimum, using the minimum"
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }

    /// Cron cadence. The expression is parsed up front so a typo fails at
    /// config load rather than at job registration.
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, SchedulerError> {
        let expr = expr.as_ref();
        cron::Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::Cron(expr.to_string()))
    }
}

impl TryFrom<String> for Schedule {
    type Error = SchedulerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match humantime::parse_duration(s.trim()) {
            Ok(d) => Ok(Self::interval(d)),
            Err(_) => Self::cron(s.trim()),
        }
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        match schedule {
            Schedule::Interval(d) => humantime::format_duration(d).to_string(),
            Schedule::Cron(expr) => expr,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {}", humantime::format_duration(*d)),
            Self::Cron(expr) => write!(f, "cron: {expr}"),
        }
    }
}

/// Trigger cadence per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulesConfig {
    /// Base trigger for tick cadence checks.
    pub tick: Schedule,
    /// Base trigger for flush cadence checks.
    pub flush: Schedule,
    pub archive: Schedule,
    pub cleanup: Schedule,
    pub mode: Schedule,
}

impl Default for SchedulesConfig {
    fn default() -> Self {
        Self {
            tick: Schedule::Interval(Duration::from_secs(1)),
            flush: Schedule::Interval(Duration::from_secs(5)),
            archive: Schedule::Interval(Duration::from_secs(300)),
            cleanup: Schedule::Interval(Duration::from_secs(3600)),
            mode: Schedule::Interval(Duration::from_secs(30)),
        }
    }
}

impl SchedulesConfig {
    /// Re-check cron expressions of configs built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for schedule in [&self.tick, &self.flush, &self.archive, &self.cleanup, &self.mode] {
            if let Schedule::Cron(expr) = schedule {
                Schedule::cron(expr).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Metadata about a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    /// Job UUID.
    pub id: uuid::Uuid,
    /// Job name, e.g. `tick:backends` or `flush`.
    pub name: String,
    /// Schedule description.
    pub schedule: String,
}

type JobFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Drives a [`Recorder`] from `tokio-cron-scheduler` jobs.
pub struct Scheduler {
    scheduler: JobScheduler,
    jobs: Arc<RwLock<HashMap<uuid::Uuid, JobInfo>>>,
    recorder: Arc<Recorder>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field(
                "job_count",
                &self.jobs.try_read().map(|j| j.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub async fn new(recorder: Arc<Recorder>) -> Result<Self, SchedulerError> {
        Ok(Self {
            scheduler: JobScheduler::new().await?,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            recorder,
        })
    }

    /// Register one tick job per known kind plus the flush, archive, cleanup
    /// and mode jobs.
    pub async fn register_all(&self, schedules: &SchedulesConfig) -> Result<(), SchedulerError> {
        for kind in self.recorder.kinds() {
            self.register_tick(&kind, &schedules.tick).await?;
        }

        self.register_blocking("flush", &schedules.flush, |recorder| {
            if let Some(reports) = recorder.flush_if_due() {
                let samples: usize = reports.iter().map(|r| r.samples).sum();
                tracing::debug!(kinds = reports.len(), samples, "Flush finished");
            }
        })
        .await?;

        self.register_blocking("archive", &schedules.archive, |recorder| {
            let archived: usize = recorder.archive().iter().map(|r| r.archived).sum();
            tracing::debug!(archived, "Archive finished");
        })
        .await?;

        self.register_blocking("cleanup", &schedules.cleanup, |recorder| {
            match recorder.cleanup() {
                Ok(report) => tracing::info!(
                    deleted = report.total(),
                    archive_samples = report.archive_samples,
                    aggregates = report.aggregates,
                    attempts = report.attempts,
                    "Cleanup finished"
                ),
                Err(e) => tracing::error!(error = %e, "Cleanup failed"),
            }
        })
        .await?;

        self.register_blocking("mode", &schedules.mode, |recorder| {
            if let Err(e) = recorder.reevaluate_mode() {
                tracing::error!(error = %e, "Mode re-evaluation failed");
            }
        })
        .await?;

        Ok(())
    }

    /// Register the tick job for `kind`.
    pub async fn register_tick(
        &self,
        kind: &str,
        schedule: &Schedule,
    ) -> Result<uuid::Uuid, SchedulerError> {
        let recorder = Arc::clone(&self.recorder);
        let kind_owned = kind.to_string();
        let job = make_job(schedule, move || {
            let (recorder, kind) = (Arc::clone(&recorder), kind_owned.clone());
            Box::pin(async move {
                if let Some(report) = recorder.tick_if_due(&kind).await {
                    tracing::trace!(kind = %kind, tick = report.tick, "Scheduled tick done");
                }
            }) as JobFuture
        })?;
        self.add(format!("tick:{kind}"), schedule, job).await
    }

    async fn register_blocking<F>(
        &self,
        name: &str,
        schedule: &Schedule,
        run: F,
    ) -> Result<uuid::Uuid, SchedulerError>
    where
        F: Fn(&Recorder) + Send + Sync + Clone + 'static,
    {
        let recorder = Arc::clone(&self.recorder);
        let job_name = name.to_string();
        let job = make_job(schedule, move || {
            let (recorder, run, job_name) = (Arc::clone(&recorder), run.clone(), job_name.clone());
            Box::pin(async move {
                // Storage calls are synchronous.
                let result = tokio::task::spawn_blocking(move || run(recorder.as_ref())).await;
                if let Err(e) = result {
                    tracing::error!(job = %job_name, error = %e, "Scheduled job panicked");
                }
            }) as JobFuture
        })?;
        self.add(name.to_string(), schedule, job).await
    }

    async fn add(
        &self,
        name: String,
        schedule: &Schedule,
        job: Job,
    ) -> Result<uuid::Uuid, SchedulerError> {
        let job_id = self.scheduler.add(job).await?;
        tracing::info!(job = %name, job_id = %job_id, schedule = %schedule, "Job registered");
        self.jobs.write().await.insert(
            job_id,
            JobInfo {
                id: job_id,
                name,
                schedule: schedule.to_string(),
            },
        );
        Ok(job_id)
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start().await?;
        tracing::info!("Scheduler started");
        Ok(())
    }

    /// List all registered jobs.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Remove a job by ID.
    pub async fn remove(&self, job_id: &uuid::Uuid) -> Result<(), SchedulerError> {
        self.scheduler.remove(job_id).await?;
        let removed = self.jobs.write().await.remove(job_id);
        tracing::info!(job_id = %job_id, job = ?removed.map(|j| j.name), "Job removed");
        Ok(())
    }

    /// Stop firing jobs, waiting up to [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout. A timeout is logged, not an error.
    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), SchedulerError> {
        let job_count = self.jobs.read().await.len();
        match tokio::time::timeout(timeout, self.scheduler.shutdown()).await {
            Ok(Ok(())) => {
                tracing::info!(job_count, "Scheduler shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(job_count, error = %e, "Scheduler shutdown failed");
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(job_count, "Scheduler shutdown timed out");
                Ok(())
            }
        }
    }
}

fn make_job<F>(schedule: &Schedule, make_future: F) -> Result<Job, SchedulerError>
where
    F: Fn() -> JobFuture + Send + Sync + 'static,
{
    let callback = move |_: uuid::Uuid, _: JobScheduler| make_future();
    match schedule {
        Schedule::Interval(d) => Job::new_repeated_async(*d, callback),
        Schedule::Cron(expr) => Job::new_cron_job_async(expr.as_str(), callback),
    }
    .map_err(SchedulerError::from)
}
