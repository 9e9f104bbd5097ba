//! Ringwarden - Ring-Buffer Telemetry Pipeline
//!
//! Samples a live system at bounded overhead, keeps a short window of raw
//! history in fixed-capacity rings, rolls it into durable aggregates and an
//! archive before it is overwritten, and throttles its own collection so
//! that observing never destabilizes the observed system.
//!
//! # Architecture
//!
//! - **Ring**: per-kind circular slot arena (`slot = tick % capacity`)
//! - **Ledger**: start/end/skip record of every tick attempt
//! - **Aggregate / Archive**: durable tiers fed from the ring by periodic jobs
//! - **Retention**: age-based cleanup per durable tier
//! - **Governor**: load shedding, load throttling, circuit breaker and the
//!   operating-mode state machine
//! - **Recorder**: tick orchestration over all of the above
//! - **Scheduler / Server**: periodic trigger and HTTP query surface
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringwarden::{ProcLoadSource, Recorder, StorageBuilder};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = StorageBuilder::new("./ringwarden.db").build()?;
//! let recorder = Recorder::new(&storage, Arc::new(ProcLoadSource::new()))?;
//!
//! let report = recorder.tick("backends").await;
//! println!("tick {} -> {:?}", report.tick, report.outcome);
//! recorder.flush();
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod archive;
pub mod config;
pub mod governor;
pub mod ledger;
pub mod probe;
pub mod recorder;
pub mod retention;
pub mod ring;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod storage;

pub use aggregate::{AggregateStore, FlushReport};
pub use archive::{ArchiveReport, ArchiveSelector, ArchiveStore};
pub use config::{AppConfig, Settings, SettingsReader};
pub use governor::{Governor, LoadSnapshot, LoadSource, SkipReason, StaticLoad};
pub use ledger::Ledger;
pub use probe::{Probe, ProbeContext, ProbeError, ProcLoadSource, Record, TcpProbe};
pub use recorder::{Recorder, StatusReport, TickOutcome, TickReport};
pub use retention::{CleanupReport, Retention};
pub use ring::{DetailRow, Ring, RingEntry, RingError, RingStore, SampleHeader};
pub use scheduler::{Schedule, Scheduler};
pub use state::{MemoryState, StateService};
pub use storage::{Mode, ModeState, StorageBuilder, StorageError, StorageHandles};
