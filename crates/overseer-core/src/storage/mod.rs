//! SQLite-based persistence layer
//!
//! This module provides:
//! - Database initialization and migrations
//! - CRUD operations for runs and agents
//! - Compare-and-set status transitions
//! - Connection pooling

mod migrations;
mod queries;

pub use migrations::run_migrations;
pub use queries::*;

use crate::error::{Error, Result, StorageError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Database connection pool type
pub type DbPool = Pool<SqliteConnectionManager>;

/// How many attempts a retried write gets before the error is surfaced
const WRITE_ATTEMPTS: u32 = 3;

/// Storage manager for database operations
pub struct Storage {
    pool: DbPool,
    db_path: PathBuf,
}

impl Storage {
    /// Create a new storage instance with a directory path
    pub fn new_with_path(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        std::fs::create_dir_all(data_dir).map_err(|e| {
            Error::Storage(StorageError::Database(format!(
                "Failed to create data directory: {}",
                e
            )))
        })?;

        let db_path = data_dir.join("overseer.db");
        info!("Database path: {:?}", db_path);

        Self::from_path(db_path)
    }

    /// Create storage in the platform default data directory
    pub fn new_default() -> Result<Self> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new_with_path(base.join("overseer"))
    }

    /// Create storage from a specific path (useful for testing)
    pub fn from_path(db_path: PathBuf) -> Result<Self> {
        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))?;

        let storage = Self { pool, db_path };
        storage.initialize()?;

        Ok(storage)
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))?;

        let storage = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
        };

        storage.initialize()?;

        Ok(storage)
    }

    /// Initialize database with migrations
    fn initialize(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.busy_timeout(Duration::from_millis(500))?;
        run_migrations(&conn)?;
        info!("Database initialized successfully");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))
    }

    /// Run a write against the database, retrying transient failures a
    /// bounded number of times with backoff. The final error is surfaced and
    /// the row is left in its last-known-good state.
    pub fn with_retry<T>(&self, mut op: impl FnMut(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            let conn = self.connection()?;
            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err @ Error::Storage(StorageError::Database(_)))
                | Err(err @ Error::Storage(StorageError::Pool(_))) => {
                    warn!("Storage write failed (attempt {}): {}", attempt, err);
                    last_err = Some(err);
                    std::thread::sleep(Duration::from_millis(25 * attempt as u64));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Storage(StorageError::Database("retry exhausted".to_string()))
        }))
    }

    /// Get the database path
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Get the connection pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_storage() {
        let storage = Storage::in_memory().unwrap();
        assert!(storage.connection().is_ok());
    }

    #[test]
    fn test_storage_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new_with_path(dir.path()).unwrap();
        assert!(storage.db_path().ends_with("overseer.db"));
    }

    #[test]
    fn test_with_retry_propagates_non_transient() {
        let storage = Storage::in_memory().unwrap();
        let result: crate::Result<()> = storage.with_retry(|_| {
            Err(crate::Error::Storage(StorageError::NotFound(
                "nope".to_string(),
            )))
        });
        assert!(matches!(
            result,
            Err(crate::Error::Storage(StorageError::NotFound(_)))
        ));
    }
}
