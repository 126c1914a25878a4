//! Local replica storage.
//!
//! The applier only needs insert / find-by-key / update-fields /
//! delete-by-key inside one transaction per message. `ReplicaStore` is that
//! seam; SQLite (sqlx + sea-query) is the shipped engine.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::config::StorageConfig;

pub mod schema;
pub mod sqlite;

pub use schema::{Column, ColumnKind, FieldError, ReplicaSchema};
pub use sqlite::SqliteReplicaStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query build error: {0}")]
    Query(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
}

/// Column name to value.
pub type Record = BTreeMap<String, FieldValue>;

/// Opens per-message transactions against the replica tables.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ReplicaTx>>;
}

/// One open transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait ReplicaTx: Send {
    /// Insert a row keyed by `key` unless one already exists.
    ///
    /// Returns `true` when a row was written.
    async fn insert_or_ignore(
        &mut self,
        schema: &ReplicaSchema,
        key: i64,
        record: &Record,
    ) -> Result<bool>;

    /// Fetch a row, key column included.
    async fn find(&mut self, schema: &ReplicaSchema, key: i64) -> Result<Option<Record>>;

    /// Overwrite only the given columns. Returns `false` when no row matched.
    async fn update_fields(
        &mut self,
        schema: &ReplicaSchema,
        key: i64,
        fields: &Record,
    ) -> Result<bool>;

    /// Returns `false` when no row matched.
    async fn delete(&mut self, schema: &ReplicaSchema, key: i64) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Open the SQLite pool described by `config`.
pub async fn open_pool(config: &StorageConfig) -> Result<SqlitePool> {
    info!(path = %config.path, "Storage: sqlite");

    if config.is_in_memory() {
        // Every connection to :memory: is a separate database; pin to one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = Path::new(&config.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&format!("sqlite:{}?mode=rwc", config.path))
        .await?;

    Ok(pool)
}
