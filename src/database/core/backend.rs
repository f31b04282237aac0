//! Backend selection and connection parameters

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::StorageError;
use crate::libraries::RuntimeLibrary;

/// Default number of pooled sessions for networked engines
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default bound on opening a single session
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on waiting for a pooled session
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// The storage engine selected by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Single-file embedded engine (SQLite)
    EmbeddedFile,
    /// In-memory or portable embedded engine (DuckDB)
    EmbeddedMemory,
    /// Networked server, MySQL/MariaDB flavour
    NetworkedEngineA,
    /// Networked server, PostgreSQL flavour
    NetworkedEngineB,
}

impl BackendKind {
    pub fn all() -> [BackendKind; 4] {
        [
            BackendKind::EmbeddedFile,
            BackendKind::EmbeddedMemory,
            BackendKind::NetworkedEngineA,
            BackendKind::NetworkedEngineB,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::EmbeddedFile => "embedded-file",
            BackendKind::EmbeddedMemory => "embedded-memory",
            BackendKind::NetworkedEngineA => "networked-engine-a",
            BackendKind::NetworkedEngineB => "networked-engine-b",
        }
    }

    /// Human-friendly engine name used in log lines
    pub fn engine(&self) -> &'static str {
        match self {
            BackendKind::EmbeddedFile => "SQLite",
            BackendKind::EmbeddedMemory => "DuckDB",
            BackendKind::NetworkedEngineA => "MySQL",
            BackendKind::NetworkedEngineB => "PostgreSQL",
        }
    }

    pub fn is_networked(&self) -> bool {
        matches!(
            self,
            BackendKind::NetworkedEngineA | BackendKind::NetworkedEngineB
        )
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            BackendKind::NetworkedEngineA => Some(3306),
            BackendKind::NetworkedEngineB => Some(5432),
            _ => None,
        }
    }

    /// The optional library that must be provisioned before this engine is
    /// usable. `None` means the engine ships with the host.
    pub fn required_library(&self) -> Option<RuntimeLibrary> {
        match self {
            BackendKind::EmbeddedFile | BackendKind::NetworkedEngineA => None,
            BackendKind::EmbeddedMemory => Some(RuntimeLibrary::DuckDb),
            BackendKind::NetworkedEngineB => Some(RuntimeLibrary::Postgresql),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "embedded-file" | "sqlite" | "file" => Ok(BackendKind::EmbeddedFile),
            "embedded-memory" | "duckdb" | "memory" | "h2" => Ok(BackendKind::EmbeddedMemory),
            "networked-engine-a" | "mysql" | "mariadb" => Ok(BackendKind::NetworkedEngineA),
            "networked-engine-b" | "postgresql" | "postgres" => Ok(BackendKind::NetworkedEngineB),
            other => Err(StorageError::Config(format!(
                "unknown storage method '{}' (expected one of: embedded-file, embedded-memory, networked-engine-a, networked-engine-b)",
                other
            ))),
        }
    }
}

/// Optional capabilities an adapter may or may not have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// `INSERT ... ON CONFLICT (...) DO UPDATE`
    UpsertOnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE`
    UpsertOnDuplicateKey,
    /// `ALTER TABLE ... ADD COLUMN IF NOT EXISTS`
    AddColumnIfNotExists,
    /// DDL statements participate in transactions
    TransactionalDdl,
    /// More than one session may be open against the same store
    NativePooling,
    /// Requires host/port/credentials
    NetworkConfig,
}

/// Parameters for opening sessions against the configured backend
///
/// Read-only once the storage manager has been constructed.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub kind: BackendKind,
    /// Store file for embedded engines. `None` selects an in-memory store for
    /// the embedded-memory engine.
    pub path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Requested pool size; embedded engines always use one session
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Extra driver properties (e.g. `ssl-mode`, `charset`, `application_name`)
    pub properties: BTreeMap<String, String>,
}

impl ConnectionConfig {
    fn base(kind: BackendKind) -> Self {
        ConnectionConfig {
            kind,
            path: None,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            properties: BTreeMap::new(),
        }
    }

    /// Single-file embedded store at `path`
    pub fn embedded_file(path: impl Into<PathBuf>) -> Self {
        ConnectionConfig {
            path: Some(path.into()),
            ..Self::base(BackendKind::EmbeddedFile)
        }
    }

    /// In-memory embedded store
    pub fn embedded_memory() -> Self {
        Self::base(BackendKind::EmbeddedMemory)
    }

    /// Networked store at `host`, using the engine's default port
    pub fn networked(kind: BackendKind, host: &str, database: &str) -> Self {
        ConnectionConfig {
            host: Some(host.to_string()),
            database: Some(database.to_string()),
            ..Self::base(kind)
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, acquire: Duration) -> Self {
        self.connect_timeout = connect;
        self.acquire_timeout = acquire;
        self
    }

    pub fn port_or_default(&self) -> u16 {
        self.port
            .or_else(|| self.kind.default_port())
            .unwrap_or_default()
    }

    /// Where the store lives, for log lines and error messages
    pub fn target(&self) -> String {
        if self.kind.is_networked() {
            format!(
                "{}:{}/{}",
                self.host.as_deref().unwrap_or("?"),
                self.port_or_default(),
                self.database.as_deref().unwrap_or("?")
            )
        } else {
            match &self.path {
                Some(p) => p.display().to_string(),
                None => ":memory:".to_string(),
            }
        }
    }

    /// Number of sessions the pool may hold open at once
    pub fn effective_pool_size(&self) -> usize {
        if self.kind.is_networked() {
            self.pool_size.max(1)
        } else {
            1
        }
    }

    /// Check that the parameters required by the selected engine are present
    pub fn validate(&self) -> Result<(), StorageError> {
        match self.kind {
            BackendKind::EmbeddedFile => {
                if self.path.is_none() {
                    return Err(StorageError::Config(
                        "embedded-file storage requires a file path".to_string(),
                    ));
                }
            }
            BackendKind::EmbeddedMemory => {}
            BackendKind::NetworkedEngineA | BackendKind::NetworkedEngineB => {
                if self.host.as_deref().map_or(true, str::is_empty) {
                    return Err(StorageError::Config(format!(
                        "{} storage requires a remote host",
                        self.kind
                    )));
                }
                if self.database.as_deref().map_or(true, str::is_empty) {
                    return Err(StorageError::Config(format!(
                        "{} storage requires a remote database name",
                        self.kind
                    )));
                }
                if self.username.is_none() {
                    return Err(StorageError::Config(format!(
                        "{} storage requires a username",
                        self.kind
                    )));
                }
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(StorageError::Config(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "REDACTED"))
            .field("pool_size", &self.pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!(
            "embedded-file".parse::<BackendKind>().unwrap(),
            BackendKind::EmbeddedFile
        );
        assert_eq!(
            "SQLite".parse::<BackendKind>().unwrap(),
            BackendKind::EmbeddedFile
        );
        assert_eq!(
            "h2".parse::<BackendKind>().unwrap(),
            BackendKind::EmbeddedMemory
        );
        assert_eq!(
            "mariadb".parse::<BackendKind>().unwrap(),
            BackendKind::NetworkedEngineA
        );
        assert_eq!(
            "postgres".parse::<BackendKind>().unwrap(),
            BackendKind::NetworkedEngineB
        );
        assert!("yaml".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for kind in BackendKind::all() {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_default_ports() {
        let mysql = ConnectionConfig::networked(BackendKind::NetworkedEngineA, "db", "app");
        assert_eq!(mysql.port_or_default(), 3306);
        let pg = ConnectionConfig::networked(BackendKind::NetworkedEngineB, "db", "app")
            .with_port(6543);
        assert_eq!(pg.port_or_default(), 6543);
        assert_eq!(pg.target(), "db:6543/app");
    }

    #[test]
    fn test_embedded_pool_is_single_session() {
        let config = ConnectionConfig::embedded_file("/tmp/x.db").with_pool_size(8);
        assert_eq!(config.effective_pool_size(), 1);
        let config = ConnectionConfig::networked(BackendKind::NetworkedEngineB, "db", "app")
            .with_pool_size(8);
        assert_eq!(config.effective_pool_size(), 8);
    }

    #[test]
    fn test_validate_networked_requires_credentials() {
        let config = ConnectionConfig::networked(BackendKind::NetworkedEngineA, "db", "app");
        assert!(config.validate().is_err());
        let config = config.with_credentials("user", "secret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig::networked(BackendKind::NetworkedEngineB, "db", "app")
            .with_credentials("user", "hunter2");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }
}
