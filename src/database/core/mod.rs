//! Core database infrastructure
//!
//! This module provides the foundational storage components shared by every
//! backend:
//! - `BackendKind` / `ConnectionConfig`: engine selection and connection parameters
//! - `Session`: one live driver connection
//! - `DialectTemplate` / `Operation`: table-driven SQL rendering
//! - `ConnectionPool`: bounded session pool with graceful drain
//! - `SchemaManager` / `Migration`: schema versioning and migration

pub mod backend;
mod connection;
pub mod dialect;
mod pool;
mod schema;

pub use backend::{
    BackendKind, ConnectionConfig, Feature, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_POOL_SIZE,
};
pub use connection::{params, Param, Row, Session, SessionExt};
pub use dialect::{identifier, like_prefix, DialectTemplate, Operation, KEY_COLUMN, MAX_KEY_LEN};
pub use pool::{ConnectionPool, DrainReport, PooledSession, SessionOpener};
pub use schema::{
    target_version, Migration, MigrationOutcome, SchemaChange, SchemaManager, SchemaStatus,
    META_TABLE,
};
