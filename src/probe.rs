//! Probes
//!
//! A probe produces the records of one collection kind on demand. The
//! orchestrator bounds every call with a timeout and treats an error or a
//! timeout as that probe's failure only.
//!
//! # Components
//!
//! - [`Probe`]: async collection contract
//! - [`TcpProbe`]: TCP connect latency to a list of targets
//! - [`ProcLoadSource`]: host load for the governor's load gates

mod procfs;
mod tcp;
mod traits;

pub use procfs::ProcLoadSource;
pub use tcp::{TcpProbe, TcpProbeConfig, TcpTarget};
pub use traits::{Probe, ProbeContext, ProbeError, Record};
