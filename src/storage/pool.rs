//! Connection pool over a single DuckDB instance.
//!
//! Built on `r2d2` with duckdb's connection manager. The manager owns one
//! database and hands out `try_clone()`s of it, so every pooled connection
//! sees committed writes immediately, and `:memory:` yields one private
//! database per pool.

use std::path::Path;
use std::sync::Arc;

use duckdb::DuckdbConnectionManager;
use r2d2::{Pool, PooledConnection};

use crate::storage::StorageError;
use crate::storage::schema::init_schema;

/// In-memory database path marker.
pub const MEMORY_PATH: &str = ":memory:";

/// A checked-out connection.
pub type PooledConn = PooledConnection<DuckdbConnectionManager>;

pub struct DbPool {
    pool: Pool<DuckdbConnectionManager>,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl DbPool {
    /// Open (or create) the database with up to `size` connections and apply
    /// the schema through the first one.
    pub fn open(path: &Path, size: u32) -> Result<Arc<Self>, StorageError> {
        let manager = if path.as_os_str() == MEMORY_PATH {
            DuckdbConnectionManager::memory()?
        } else {
            DuckdbConnectionManager::file(path)?
        };
        let pool = Pool::builder().max_size(size.max(1)).build(manager)?;
        let conn = pool.get()?;
        init_schema(&conn)?;
        drop(conn);

        Ok(Arc::new(Self { pool }))
    }

    /// Check out a connection, waiting for one to be returned if all are busy.
    pub fn get(&self) -> Result<PooledConn, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Maximum number of pooled connections.
    pub fn size(&self) -> usize {
        self.pool.max_size() as usize
    }
}
