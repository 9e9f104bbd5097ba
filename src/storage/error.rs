//! Error type shared by every durable tier.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb: {0}")]
    Database(#[from] duckdb::Error),

    /// No connection could be checked out of the pool.
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// Skip reasons, metric maps and detail rows are stored as JSON text.
    #[error("json encoding: {0}")]
    Json(#[from] serde_json::Error),

    /// Lock poisoning, filesystem setup.
    #[error("storage internal: {0}")]
    Internal(String),

    /// A stored value that does not decode (unknown mode, negative tick).
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),
}
