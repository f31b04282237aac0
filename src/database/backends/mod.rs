//! Backend adapters
//!
//! One adapter per [`BackendKind`]. An adapter knows how to open sessions for
//! its engine and which dialect row and optional library it needs; everything
//! else is shared.
//!
//! ```text
//! backends/
//! ├── sqlite      # embedded-file (rusqlite, built in)
//! ├── duckdb      # embedded-memory (duckdb, provisioned)
//! └── networked   # networked-engine-a (MySQL, built in)
//!                 # networked-engine-b (PostgreSQL, provisioned)
//! ```

pub mod duckdb;
pub mod networked;
pub mod sqlite;

use crate::database::core::{
    BackendKind, ConnectionConfig, DialectTemplate, Feature, Operation, Session,
};
use crate::error::{ConnectionError, QueryError, StorageError};
use crate::libraries::{DriverHandle, RuntimeLibrary};

pub use self::duckdb::DuckDbAdapter;
pub use self::networked::{MySqlAdapter, PgAdapter};
pub use self::sqlite::SqliteAdapter;

/// Engine-specific half of the storage layer
pub trait Adapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Open one new session, bounded by the configured connect timeout
    fn open_session(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>, ConnectionError>;

    fn dialect(&self) -> &'static DialectTemplate {
        DialectTemplate::for_kind(self.kind())
    }

    /// Statement text for `op` on this engine
    fn dialect_for(&self, op: &Operation<'_>) -> Result<String, QueryError> {
        self.dialect().render(op)
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        self.dialect().supports(feature)
    }

    fn required_library(&self) -> Option<RuntimeLibrary> {
        self.kind().required_library()
    }
}

/// Build the adapter for `kind`
///
/// Engines backed by an optional library need the [`DriverHandle`] the
/// provisioner issued for it; built-in engines ignore `driver`.
pub fn adapter_for(
    kind: BackendKind,
    driver: Option<DriverHandle>,
) -> Result<Box<dyn Adapter>, StorageError> {
    let require = |driver: Option<DriverHandle>| -> Result<DriverHandle, StorageError> {
        match driver {
            Some(d) if d.backend == kind && !d.is_present() => Err(StorageError::Config(format!(
                "driver library {} for {} is missing; provision {} again",
                d.library_path.display(),
                kind,
                d.library
            ))),
            Some(d) if d.backend == kind => Ok(d),
            Some(d) => Err(StorageError::Config(format!(
                "driver for {} cannot serve {}",
                d.backend, kind
            ))),
            None => Err(StorageError::Config(format!(
                "{} requires a provisioned driver library",
                kind
            ))),
        }
    };

    match kind {
        BackendKind::EmbeddedFile => Ok(Box::new(SqliteAdapter)),
        BackendKind::EmbeddedMemory => Ok(Box::new(DuckDbAdapter::new(require(driver)?))),
        BackendKind::NetworkedEngineA => Ok(Box::new(MySqlAdapter::new()?)),
        BackendKind::NetworkedEngineB => Ok(Box::new(PgAdapter::new(require(driver)?)?)),
    }
}
