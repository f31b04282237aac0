//! Networked backends (MySQL/MariaDB and PostgreSQL) over `sqlx`
//!
//! `sqlx` is async; the storage surface is not. Each adapter owns a small
//! private tokio runtime and every session call is driven to completion with
//! `block_on`. Calls must therefore not be made from inside another tokio
//! runtime's worker thread.

use std::sync::Arc;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Row as _};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::database::backends::Adapter;
use crate::database::core::{BackendKind, ConnectionConfig, Param, Row, Session};
use crate::error::{ConnectionError, QueryError, StorageError};
use crate::libraries::DriverHandle;

fn build_runtime(kind: BackendKind) -> Result<Arc<Runtime>, StorageError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("hoststore-sql")
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|e| {
            StorageError::Config(format!(
                "failed to start the {} client runtime: {}",
                kind.engine(),
                e
            ))
        })
}

/// SQLSTATE classes that mean "the credentials were refused"
fn is_auth_failure(code: &str) -> bool {
    code == "28000" || code == "28P01"
}

/// SQLSTATE codes worth retrying: serialization failures, deadlocks, and
/// connection exceptions
fn is_transient_state(code: &str) -> bool {
    code == "40001" || code == "40P01" || code.starts_with("08")
}

fn classify_connect(
    kind: BackendKind,
    target: &str,
    e: sqlx::Error,
) -> ConnectionError {
    match &e {
        sqlx::Error::Database(db) if db.code().is_some_and(|c| is_auth_failure(&c)) => {
            ConnectionError::AuthRejected {
                backend: kind,
                reason: db.message().to_string(),
            }
        }
        _ => ConnectionError::Unreachable {
            backend: kind,
            target: target.to_string(),
            reason: e.to_string(),
        },
    }
}

fn classify(e: sqlx::Error) -> QueryError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => QueryError::Transient(e.to_string()),
        sqlx::Error::Database(db) if db.code().is_some_and(|c| is_transient_state(&c)) => {
            QueryError::Transient(e.to_string())
        }
        _ => QueryError::Database(e.to_string()),
    }
}

/// Run a connect future under the configured connect timeout
fn connect_within<C, F>(
    runtime: &Runtime,
    config: &ConnectionConfig,
    connect: F,
) -> Result<C, ConnectionError>
where
    F: std::future::Future<Output = Result<C, sqlx::Error>>,
{
    let target = config.target();
    // the timer must be created inside the runtime
    let timeout = config.connect_timeout;
    match runtime.block_on(async move { tokio::time::timeout(timeout, connect).await }) {
        Ok(Ok(conn)) => {
            debug!("connected to {} at {}", config.kind.engine(), target);
            Ok(conn)
        }
        Ok(Err(e)) => Err(classify_connect(config.kind, &target, e)),
        Err(_) => Err(ConnectionError::Timeout {
            backend: config.kind,
            target,
            after: config.connect_timeout,
        }),
    }
}

macro_rules! networked_session {
    ($name:ident, $conn:ty, $kind:expr) => {
        pub struct $name {
            conn: $conn,
            runtime: Arc<Runtime>,
        }

        impl Session for $name {
            fn backend(&self) -> BackendKind {
                $kind
            }

            fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64, QueryError> {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = query.bind(param.clone());
                }
                let result = self
                    .runtime
                    .block_on(query.execute(&mut self.conn))
                    .map_err(classify)?;
                Ok(result.rows_affected())
            }

            fn query(
                &mut self,
                sql: &str,
                params: &[Param],
                columns: usize,
            ) -> Result<Vec<Row>, QueryError> {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = query.bind(param.clone());
                }
                let rows = self
                    .runtime
                    .block_on(query.fetch_all(&mut self.conn))
                    .map_err(classify)?;
                rows.iter()
                    .map(|row| {
                        (0..columns)
                            .map(|i| row.try_get::<Option<String>, _>(i).map_err(classify))
                            .collect::<Result<Row, _>>()
                    })
                    .collect()
            }

            fn execute_batch(&mut self, sql: &str) -> Result<(), QueryError> {
                self.runtime
                    .block_on(sqlx::raw_sql(sql).execute(&mut self.conn))
                    .map(|_| ())
                    .map_err(classify)
            }

            fn ping(&mut self) -> bool {
                self.runtime.block_on(self.conn.ping()).is_ok()
            }

            fn close(self: Box<Self>) {
                let $name { conn, runtime } = *self;
                if let Err(e) = runtime.block_on(conn.close()) {
                    debug!("error closing {} connection: {}", $kind.engine(), e);
                }
            }
        }
    };
}

networked_session!(MySqlSession, MySqlConnection, BackendKind::NetworkedEngineA);
networked_session!(PgSession, PgConnection, BackendKind::NetworkedEngineB);

/// MySQL/MariaDB adapter. The client is built in, so no driver handle is needed.
pub struct MySqlAdapter {
    runtime: Arc<Runtime>,
}

impl MySqlAdapter {
    pub fn new() -> Result<Self, StorageError> {
        Ok(MySqlAdapter {
            runtime: build_runtime(BackendKind::NetworkedEngineA)?,
        })
    }

    fn options(config: &ConnectionConfig) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(config.host.as_deref().unwrap_or("localhost"))
            .port(config.port_or_default());
        if let Some(database) = &config.database {
            options = options.database(database);
        }
        if let Some(username) = &config.username {
            options = options.username(username);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        for (key, value) in &config.properties {
            match key.as_str() {
                "charset" => options = options.charset(value),
                "ssl-mode" => match value.to_lowercase().as_str() {
                    "disabled" | "disable" => options = options.ssl_mode(MySqlSslMode::Disabled),
                    "preferred" | "prefer" => options = options.ssl_mode(MySqlSslMode::Preferred),
                    "required" | "require" => options = options.ssl_mode(MySqlSslMode::Required),
                    other => warn!("ignoring unknown MySQL ssl-mode '{}'", other),
                },
                other => warn!("ignoring unsupported MySQL property '{}'", other),
            }
        }
        options
    }
}

impl Adapter for MySqlAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkedEngineA
    }

    fn open_session(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>, ConnectionError> {
        let options = Self::options(config);
        let conn = connect_within(&self.runtime, config, MySqlConnection::connect_with(&options))?;
        Ok(Box::new(MySqlSession {
            conn,
            runtime: Arc::clone(&self.runtime),
        }))
    }
}

/// PostgreSQL adapter, available once its driver library has been provisioned
pub struct PgAdapter {
    runtime: Arc<Runtime>,
    driver: DriverHandle,
}

impl PgAdapter {
    pub fn new(driver: DriverHandle) -> Result<Self, StorageError> {
        info!(
            "PostgreSQL driver ready ({} from {})",
            driver.entry_point,
            driver.library_path.display()
        );
        Ok(PgAdapter {
            runtime: build_runtime(BackendKind::NetworkedEngineB)?,
            driver,
        })
    }

    pub fn driver(&self) -> &DriverHandle {
        &self.driver
    }

    fn options(config: &ConnectionConfig) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(config.host.as_deref().unwrap_or("localhost"))
            .port(config.port_or_default());
        if let Some(database) = &config.database {
            options = options.database(database);
        }
        if let Some(username) = &config.username {
            options = options.username(username);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        for (key, value) in &config.properties {
            match key.as_str() {
                "application_name" => options = options.application_name(value),
                "ssl-mode" => match value.to_lowercase().as_str() {
                    "disabled" | "disable" => options = options.ssl_mode(PgSslMode::Disable),
                    "preferred" | "prefer" => options = options.ssl_mode(PgSslMode::Prefer),
                    "required" | "require" => options = options.ssl_mode(PgSslMode::Require),
                    other => warn!("ignoring unknown PostgreSQL ssl-mode '{}'", other),
                },
                other => warn!("ignoring unsupported PostgreSQL property '{}'", other),
            }
        }
        options
    }
}

impl Adapter for PgAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkedEngineB
    }

    fn open_session(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>, ConnectionError> {
        let options = Self::options(config);
        let conn = connect_within(&self.runtime, config, PgConnection::connect_with(&options))?;
        Ok(Box::new(PgSession {
            conn,
            runtime: Arc::clone(&self.runtime),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sqlstate_classes() {
        assert!(is_auth_failure("28P01"));
        assert!(is_auth_failure("28000"));
        assert!(!is_auth_failure("42P01"));
        assert!(is_transient_state("40001"));
        assert!(is_transient_state("08006"));
        assert!(!is_transient_state("23505"));
    }

    #[test]
    fn test_unreachable_server_fails_fast() {
        // nothing listens on port 1 of the loopback interface
        let config = ConnectionConfig::networked(BackendKind::NetworkedEngineA, "127.0.0.1", "app")
            .with_port(1)
            .with_credentials("user", "secret")
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
        let adapter = MySqlAdapter::new().unwrap();
        match adapter.open_session(&config) {
            Err(ConnectionError::Unreachable { backend, .. }) => {
                assert_eq!(backend, BackendKind::NetworkedEngineA)
            }
            Err(ConnectionError::Timeout { .. }) => {}
            other => panic!("expected a connection failure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_unreachable_postgres_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let library_path = dir.path().join("postgresql-42.7.7.jar");
        std::fs::write(&library_path, b"jar").unwrap();
        let adapter = PgAdapter::new(DriverHandle {
            backend: BackendKind::NetworkedEngineB,
            library: "postgresql".to_string(),
            entry_point: "hoststore.libs.postgresql.Driver".to_string(),
            library_path,
        })
        .unwrap();

        let config = ConnectionConfig::networked(BackendKind::NetworkedEngineB, "127.0.0.1", "app")
            .with_port(1)
            .with_credentials("user", "secret")
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
        assert!(matches!(
            adapter.open_session(&config).err(),
            Some(ConnectionError::Unreachable { .. } | ConnectionError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mysql_options_apply_properties() {
        let mut config =
            ConnectionConfig::networked(BackendKind::NetworkedEngineA, "db.internal", "app")
                .with_credentials("user", "secret");
        config
            .properties
            .insert("charset".to_string(), "utf8mb4".to_string());
        let rendered = format!("{:?}", MySqlAdapter::options(&config));
        assert!(rendered.contains("db.internal"));
        assert!(rendered.contains("3306"));
    }
}
