#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! hoststore - runtime library provisioning and multi-backend storage
//!
//! hoststore is a support library for plugins running inside a host process.
//! It gives plugin authors one persistence API over several relational engines
//! and keeps heavyweight driver and helper libraries off the host's library
//! path until a feature actually needs them.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | (none)  | Library: provisioning + storage | `rusqlite`, `duckdb`, `sqlx`, `ureq`, `zip` |
//! | `cli`   | Operator CLI binary | `clap`, `tabled`, `tracing-subscriber` |
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - **[`libraries`]**: optional library provisioning
//!   - `registry`: descriptor table of the optional libraries
//!   - `repository` / `resolver`: cached, verified, single-flight downloads
//!   - `relocate` / `loader`: package relocation into a private namespace
//!
//! - **[`database`]**: backend-agnostic storage
//!   - `core`: sessions, dialect table, pooling, schema migration
//!   - `backends`: embedded-file, embedded-memory and two networked engines
//!   - `manager`: lifecycle state machine and query surface
//!   - `transfer`: moving a store to another engine
//!
//! - **[`config`]**: configuration management
//! - **[`error`]**: error taxonomy
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hoststore::{HostStore, HostStoreConfig, Migration};
//!
//! let config = HostStoreConfig::new(&None)?;
//! let migrations = vec![Migration::new(1, "player table").create_table("players", &["name"])];
//! let host = HostStore::startup(config, migrations);
//!
//! if let Ok(storage) = host.storage() {
//!     storage.upsert("players", "alice", &[("name", Some("Alice"))])?;
//! }
//! if host.is_library_ready("bstats-base") {
//!     // start metrics
//! }
//!
//! host.shutdown();
//! ```

pub mod config;
pub mod database;
pub mod error;
mod host;
pub mod libraries;

// =============================================================================
// Configuration
// =============================================================================

pub use config::{HostStoreConfig, LibrariesSection, RemoteSection, StorageConfig, StorageSection};

// =============================================================================
// Collaborator boundary
// =============================================================================

pub use host::HostStore;

// =============================================================================
// Errors
// =============================================================================

pub use error::{
    ConnectionError, MigrationError, ProvisioningError, QueryError, ResourceError, StorageError,
};

// =============================================================================
// Storage
// =============================================================================

pub use database::{
    BackendKind, ConnectionConfig, Feature, Migration, Record, StorageManager, StorageSettings,
    StorageState, TransferReport,
};

// =============================================================================
// Library provisioning
// =============================================================================

pub use libraries::{
    Capability, DriverHandle, LibraryDescriptor, LibraryHandle, Provisioner, ProvisionerConfig,
    Registry, RuntimeLibrary,
};
