//! Database module
//!
//! Backend-agnostic relational storage for hoststore, organized into:
//!
//! - **core**: engine selection, sessions, dialect table, pooling, schema management
//! - **backends**: one adapter per supported engine
//! - **manager**: the storage manager (lifecycle + query surface)
//! - **transfer**: copying one store into another
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/           # Foundation
//! │   ├── backend     # BackendKind, ConnectionConfig, Feature
//! │   ├── connection  # Session trait
//! │   ├── dialect     # per-engine SQL templates
//! │   ├── pool        # bounded session pool
//! │   └── schema      # meta table, migrations, declared tables
//! │
//! ├── backends/       # Engine adapters
//! │   ├── sqlite      # embedded-file
//! │   ├── duckdb      # embedded-memory
//! │   └── networked   # networked-engine-a / networked-engine-b
//! │
//! ├── manager         # StorageManager
//! └── transfer        # store-to-store copy, storage file rotation
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hoststore::database::{ConnectionConfig, StorageManager, StorageSettings};
//!
//! let config = ConnectionConfig::embedded_file("~/.hoststore/data/sqlite/data.db");
//! let settings = StorageSettings::default().with_table("players", &["name", "score"]);
//! let storage = StorageManager::new(config, settings);
//! storage.start(None)?;
//!
//! storage.upsert("players", "alice", &[("name", Some("Alice"))])?;
//! let name = storage.read_value("players", "alice", "name")?;
//!
//! storage.shutdown();
//! ```

pub mod backends;
pub mod core;
pub mod manager;
pub mod transfer;

// Engine selection and connection parameters
pub use core::{BackendKind, ConnectionConfig, Feature};

// Sessions, dialect and pooling
pub use core::{
    ConnectionPool, DialectTemplate, DrainReport, Operation, Param, PooledSession, Row, Session,
    SessionExt,
};

// Schema management
pub use core::{Migration, MigrationOutcome, SchemaManager, SchemaStatus, META_TABLE};

// Adapters
pub use backends::{adapter_for, Adapter};

// Storage manager
pub use manager::{Record, StorageManager, StorageSettings, StorageState, DEFAULT_SHUTDOWN_TIMEOUT};

// Store transfer
pub use transfer::{
    copy_store, pending_storage_file, rotate_storage_files, TableTransfer, TransferReport,
    PENDING_STORAGE_FILE, PREVIOUS_STORAGE_FILE, STORAGE_FILE,
};

// =============================================================================
// Helper function
// =============================================================================

/// Ensure the data directory exists
pub fn ensure_data_dir(data_dir: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))
}
