//! Opening the database.
//!
//! [`StorageBuilder`] opens (or creates) the DuckDB file, applies the schema
//! and hands back [`StorageHandles`]: one handle per durable tier, all sharing
//! a single connection pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aggregate::AggregateStore;
use crate::archive::ArchiveStore;
use crate::ledger::Ledger;
use crate::retention::Retention;
use crate::storage::StorageError;
use crate::storage::pool::{DbPool, MEMORY_PATH};
use crate::storage::state_store::StateStore;

const MIN_POOL_SIZE: u32 = 2;
const MAX_POOL_SIZE: u32 = 32;

/// One connection per CPU, within `[MIN_POOL_SIZE, MAX_POOL_SIZE]`.
fn default_pool_size() -> u32 {
    let cpus = std::thread::available_parallelism().map_or(4, |n| n.get() as u32);
    cpus.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE)
}

#[derive(Debug, Clone)]
pub struct StorageBuilder {
    path: PathBuf,
    pool_size: u32,
}

impl StorageBuilder {
    /// Database at `path`; the file and its directory are created on build.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().into(),
            pool_size: default_pool_size(),
        }
    }

    /// Isolated in-memory database.
    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH)
    }

    /// Connections to open, at most `MAX_POOL_SIZE`.
    pub fn pool_size(self, size: u32) -> Self {
        Self {
            pool_size: size.clamp(1, MAX_POOL_SIZE),
            ..self
        }
    }

    pub fn build(self) -> Result<StorageHandles, StorageError> {
        if self.path.as_os_str() != MEMORY_PATH {
            ensure_parent(&self.path)?;
        }

        let pool = DbPool::open(&self.path, self.pool_size)?;
        tracing::info!(path = %self.path.display(), pool_size = pool.size(), "Storage opened");

        Ok(StorageHandles {
            ledger: Ledger::new(Arc::clone(&pool)),
            aggregates: AggregateStore::new(Arc::clone(&pool)),
            archive: ArchiveStore::new(Arc::clone(&pool)),
            retention: Retention::new(Arc::clone(&pool)),
            state: Arc::new(StateStore::new(Arc::clone(&pool))),
            pool,
        })
    }
}

fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
            std::fs::create_dir_all(dir).map_err(|e| {
                StorageError::Internal(format!("cannot create {}: {e}", dir.display()))
            })
        }
        _ => Ok(()),
    }
}

/// Per-tier handles over one pool.
#[derive(Debug, Clone)]
pub struct StorageHandles {
    /// Collection attempt ledger.
    pub ledger: Ledger,
    /// Time-bucketed rollups.
    pub aggregates: AggregateStore,
    /// Raw sample archive.
    pub archive: ArchiveStore,
    /// Age-based cleanup.
    pub retention: Retention,
    /// Mode record and live settings.
    pub state: Arc<StateStore>,
    pool: Arc<DbPool>,
}

impl StorageHandles {
    /// The shared connection pool.
    pub fn pool(&self) -> &Arc<DbPool> {
        &self.pool
    }
}
