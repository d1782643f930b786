//! Error types for Overseer Core

use thiserror::Error;

/// Main error type for Overseer operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Run-execution errors
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent is disabled: {0}")]
    AgentDisabled(String),

    #[error("Run already has a live process: {0}")]
    AlreadyRunning(String),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("Invalid state transition for run {run_id}: expected {expected}, found {actual}")]
    InvalidStateTransition {
        run_id: String,
        expected: String,
        actual: String,
    },
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Unknown run status in storage: {0}")]
    UnknownStatus(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Connection pool error: {0}")]
    Pool(String),
}

/// Sandbox policy errors
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Platform not supported: {0}")]
    UnsupportedPlatform(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Storage(StorageError::Pool(err.to_string()))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
