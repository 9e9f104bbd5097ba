//! Host load from procfs.
//!
//! Utilization is the 1-minute load average over available parallelism, as a
//! percentage. Workload rate is process creations per second (`processes` in
//! `/proc/stat`), measured over windows of at least [`MIN_RATE_WINDOW`].
//! Readings inside a window repeat the last measured rate.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::governor::{LoadSnapshot, LoadSource};

/// Shortest interval a workload rate is computed over.
pub const MIN_RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct ForkWindow {
    started: Instant,
    forks: u64,
    rate: f64,
}

/// [`LoadSource`] backed by `/proc/loadavg` and `/proc/stat`.
#[derive(Debug)]
pub struct ProcLoadSource {
    root: PathBuf,
    cpus: f64,
    rate_window: Duration,
    window: Mutex<Option<ForkWindow>>,
}

impl Default for ProcLoadSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcLoadSource {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1) as f64;
        Self {
            root: root.into(),
            cpus,
            rate_window: MIN_RATE_WINDOW,
            window: Mutex::new(None),
        }
    }

    /// Measure the workload rate over windows of at least `window`.
    pub fn with_rate_window(self, window: Duration) -> Self {
        Self {
            rate_window: window.max(Duration::from_millis(1)),
            ..self
        }
    }

    fn read(&self, file: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.root.join(file))
    }
}

impl LoadSource for ProcLoadSource {
    fn sample(&self) -> std::io::Result<LoadSnapshot> {
        let load1 = parse_loadavg(&self.read("loadavg")?)?;
        let forks = parse_forks(&self.read("stat")?)?;
        let now = Instant::now();

        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let workload_rate = match *window {
            Some(w) if now.duration_since(w.started) < self.rate_window => w.rate,
            Some(w) => {
                let secs = now.duration_since(w.started).as_secs_f64();
                let rate = forks.saturating_sub(w.forks) as f64 / secs;
                *window = Some(ForkWindow {
                    started: now,
                    forks,
                    rate,
                });
                rate
            }
            None => {
                *window = Some(ForkWindow {
                    started: now,
                    forks,
                    rate: 0.0,
                });
                0.0
            }
        };

        Ok(LoadSnapshot {
            utilization_pct: load1 / self.cpus * 100.0,
            workload_rate,
        })
    }
}

fn invalid(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

/// First field of `/proc/loadavg`.
fn parse_loadavg(content: &str) -> std::io::Result<f64> {
    content
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| invalid("malformed /proc/loadavg"))
}

/// `processes` counter of `/proc/stat`.
fn parse_forks(content: &str) -> std::io::Result<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("processes "))
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| invalid("no processes line in /proc/stat"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::config::ThrottleSettings;
    use crate::governor::load::throttle_gate;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/389 12345\n").unwrap(), 0.52);
        assert!(parse_loadavg("").is_err());
    }

    #[test]
    fn test_parse_forks() {
        let stat = "cpu  1 2 3 4\nctxt 99\nprocesses 4242\nprocs_running 1\n";
        assert_eq!(parse_forks(stat).unwrap(), 4242);
        assert!(parse_forks("cpu 1 2 3\n").is_err());
    }

    #[test]
    fn test_sample_from_fake_procfs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("loadavg"), "2.00 1.00 1.00 1/100 1\n").unwrap();
        std::fs::write(dir.path().join("stat"), "processes 100\n").unwrap();

        let source =
            ProcLoadSource::with_root(dir.path()).with_rate_window(Duration::from_millis(20));
        let first = source.sample().unwrap();
        assert_eq!(first.workload_rate, 0.0);
        assert!((first.utilization_pct - 200.0 / source.cpus).abs() < 1e-9);

        std::thread::sleep(Duration::from_millis(30));
        std::fs::write(dir.path().join("stat"), "processes 150\n").unwrap();
        let second = source.sample().unwrap();
        assert!(second.workload_rate > 0.0);
        assert!(second.workload_rate < 50.0 / 0.03);

        // Inside the next window the measured rate is repeated.
        std::fs::write(dir.path().join("stat"), "processes 9000\n").unwrap();
        assert_eq!(source.sample().unwrap().workload_rate, second.workload_rate);
    }

    #[test]
    fn test_back_to_back_samples_do_not_throttle() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.10 0.10 0.10 1/100 1\n").unwrap();
        std::fs::write(dir.path().join("stat"), "processes 100\n").unwrap();

        let source = ProcLoadSource::with_root(dir.path());
        source.sample().unwrap();
        std::fs::write(dir.path().join("stat"), "processes 103\n").unwrap();
        let snapshot = source.sample().unwrap();

        assert_eq!(snapshot.workload_rate, 0.0);
        let throttle = ThrottleSettings {
            enabled: true,
            threshold: 1000.0,
        };
        assert_eq!(throttle_gate(&throttle, &snapshot), None);
    }

    #[test]
    fn test_missing_procfs_is_error() {
        let source = ProcLoadSource::with_root("/nonexistent/ringwarden");
        assert!(source.sample().is_err());
    }
}
