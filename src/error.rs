//! Error taxonomy
//!
//! Provisioning, connection, resource, migration and query failures each have
//! their own enum so callers can tell "the driver could not be downloaded"
//! apart from "the server rejected our password". [`StorageError`] wraps all of
//! them for the storage manager's public surface.

use std::time::Duration;

use thiserror::Error;

use crate::database::BackendKind;

/// Failure to make an optional library available.
///
/// Cloneable so that every waiter on a shared in-flight resolution observes
/// the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("library {coordinate} is unreachable: {reason}")]
    Unreachable { coordinate: String, reason: String },

    #[error("library {coordinate} failed checksum verification (expected {expected}, got {actual})")]
    ChecksumMismatch {
        coordinate: String,
        expected: String,
        actual: String,
    },

    #[error("library {coordinate} was not found in any repository")]
    NotFound { coordinate: String },

    #[error("library {coordinate} is corrupt: {reason}")]
    CorruptArtifact { coordinate: String, reason: String },
}

impl ProvisioningError {
    pub fn coordinate(&self) -> &str {
        match self {
            ProvisioningError::Unreachable { coordinate, .. }
            | ProvisioningError::ChecksumMismatch { coordinate, .. }
            | ProvisioningError::NotFound { coordinate }
            | ProvisioningError::CorruptArtifact { coordinate, .. } => coordinate,
        }
    }
}

/// Failure to open a session against a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("{backend} rejected the credentials: {reason}")]
    AuthRejected { backend: BackendKind, reason: String },

    #[error("{backend} at {target} is unreachable: {reason}")]
    Unreachable {
        backend: BackendKind,
        target: String,
        reason: String,
    },

    #[error("{backend} at {target} did not answer within {after:?}")]
    Timeout {
        backend: BackendKind,
        target: String,
        after: Duration,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("no connection became available within {waited:?} (pool size {size})")]
    PoolExhausted { waited: Duration, size: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("schema step v{version} ({description}) is not idempotent and was interrupted midway; manual intervention required")]
    NonIdempotentStepFailedMidway { version: u32, description: String },

    #[error("schema step v{version} failed: {reason}")]
    StepFailed { version: u32, reason: String },

    #[error("store schema v{found} is newer than the supported v{supported}")]
    NewerStore { found: u32, supported: u32 },
}

/// Failure of a single statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The engine reported a condition that may clear on retry (lost
    /// connection, busy database).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
}

impl QueryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_))
    }
}

/// Umbrella error for the storage manager.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("failed to provision the storage driver")]
    Provisioning(#[from] ProvisioningError),

    #[error("failed to connect to the store")]
    Connection(#[from] ConnectionError),

    #[error("storage resource unavailable")]
    Resource(#[from] ResourceError),

    #[error("schema migration failed")]
    Migration(#[from] MigrationError),

    #[error("query failed")]
    Query(#[from] QueryError),

    #[error("storage is not available (state: {state})")]
    NotReady { state: String },

    #[error("invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    /// Render the error and its sources as a single line, outermost first.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}
