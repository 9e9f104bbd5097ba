//! Storage Layer
//!
//! DuckDB persistence for the durable tiers and control state. All facades
//! share one r2d2-backed [`DbPool`], so every facade sees committed
//! writes immediately.
//!
//! # Components
//!
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and facade handles
//! - [`StateStore`]: persisted mode record and live settings
//! - [`DbPool`]: shared connection pool

mod builder;
mod error;
pub mod pool;
pub(crate) mod schema;
mod state_store;
pub(crate) mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use error::StorageError;
pub use pool::DbPool;
pub use state_store::StateStore;
pub use types::{
    AggregateBucket, ArchiveRecord, AttemptId, CollectionAttempt, Mode, ModeState, sample_id,
};
