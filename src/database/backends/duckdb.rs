//! Embedded-memory backend (DuckDB)
//!
//! Runs fully in memory unless a store file is configured, in which case the
//! store is a single portable file. The engine is an optional library, so the
//! adapter can only be built from a [`DriverHandle`] issued by the provisioner.
//! Each session keeps its extension and spill directories inside the driver's
//! scope directory, next to the relocated library.

use std::path::Path;

use duckdb::types::Value;
use duckdb::{params_from_iter, Connection};
use tracing::{debug, info};

use crate::database::backends::Adapter;
use crate::database::core::{BackendKind, ConnectionConfig, Param, Row, Session};
use crate::error::{ConnectionError, QueryError};
use crate::libraries::DriverHandle;

pub struct DuckDbAdapter {
    driver: DriverHandle,
}

impl DuckDbAdapter {
    pub fn new(driver: DriverHandle) -> Self {
        info!(
            "DuckDB driver ready ({} from {})",
            driver.entry_point,
            driver.library_path.display()
        );
        DuckDbAdapter { driver }
    }

    pub fn driver(&self) -> &DriverHandle {
        &self.driver
    }
}

impl Adapter for DuckDbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::EmbeddedMemory
    }

    fn open_session(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>, ConnectionError> {
        let mut session = match &config.path {
            Some(path) => DuckDbSession::open(path)?,
            None => DuckDbSession::open_in_memory()?,
        };
        session.use_runtime_dir(self.driver.scope_dir())?;
        Ok(Box::new(session))
    }
}

pub struct DuckDbSession {
    conn: Connection,
}

impl DuckDbSession {
    pub fn open(path: &Path) -> Result<Self, ConnectionError> {
        let unreachable = |reason: String| ConnectionError::Unreachable {
            backend: BackendKind::EmbeddedMemory,
            target: path.display().to_string(),
            reason,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| unreachable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| unreachable(e.to_string()))?;
        debug!("opened DuckDB store at {}", path.display());
        Ok(DuckDbSession { conn })
    }

    pub fn open_in_memory() -> Result<Self, ConnectionError> {
        let conn = Connection::open_in_memory().map_err(|e| ConnectionError::Unreachable {
            backend: BackendKind::EmbeddedMemory,
            target: ":memory:".to_string(),
            reason: e.to_string(),
        })?;
        Ok(DuckDbSession { conn })
    }

    /// Keep extensions and spill files under `dir`
    pub fn use_runtime_dir(&mut self, dir: &Path) -> Result<(), ConnectionError> {
        let quoted = |sub: &str| dir.join(sub).display().to_string().replace('\'', "''");
        let sql = format!(
            "SET extension_directory = '{}'; SET temp_directory = '{}';",
            quoted("extensions"),
            quoted("tmp")
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|e| ConnectionError::Unreachable {
                backend: BackendKind::EmbeddedMemory,
                target: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        debug!("DuckDB runtime directory is {}", dir.display());
        Ok(())
    }
}

fn bind(params: &[Param]) -> Vec<Value> {
    params
        .iter()
        .map(|p| match p {
            Some(s) => Value::Text(s.clone()),
            None => Value::Null,
        })
        .collect()
}

fn text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) => Some(s),
        Value::Boolean(b) => Some(b.to_string()),
        Value::TinyInt(i) => Some(i.to_string()),
        Value::SmallInt(i) => Some(i.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::BigInt(i) => Some(i.to_string()),
        Value::HugeInt(i) => Some(i.to_string()),
        Value::UTinyInt(i) => Some(i.to_string()),
        Value::USmallInt(i) => Some(i.to_string()),
        Value::UInt(i) => Some(i.to_string()),
        Value::UBigInt(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(f) => Some(f.to_string()),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        other => Some(format!("{:?}", other)),
    }
}

fn classify(e: duckdb::Error) -> QueryError {
    let message = e.to_string();
    // write-write conflicts between concurrent transactions clear on retry
    if message.contains("Conflict") {
        QueryError::Transient(message)
    } else {
        QueryError::Database(message)
    }
}

impl Session for DuckDbSession {
    fn backend(&self) -> BackendKind {
        BackendKind::EmbeddedMemory
    }

    fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64, QueryError> {
        let affected = self
            .conn
            .execute(sql, params_from_iter(bind(params)))
            .map_err(classify)?;
        Ok(affected as u64)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[Param],
        columns: usize,
    ) -> Result<Vec<Row>, QueryError> {
        let mut stmt = self.conn.prepare(sql).map_err(classify)?;
        let mut rows = stmt.query(params_from_iter(bind(params))).map_err(classify)?;
        let mut out = vec![];
        while let Some(row) = rows.next().map_err(classify)? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                let value: Value = row.get(i).map_err(classify)?;
                values.push(text(value));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), QueryError> {
        self.conn.execute_batch(sql).map_err(classify)
    }

    fn close(self: Box<Self>) {
        if let Err((_, e)) = self.conn.close() {
            debug!("error closing DuckDB connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{params, SessionExt};

    #[test]
    fn test_in_memory_round_trip() {
        let mut session = DuckDbSession::open_in_memory().unwrap();
        session
            .execute_batch("CREATE TABLE t (id VARCHAR PRIMARY KEY, v VARCHAR)")
            .unwrap();
        session
            .execute("INSERT INTO t (id, v) VALUES (?, ?)", &params(&["k", "v1"]))
            .unwrap();
        session
            .execute(
                "INSERT INTO t (id, v) VALUES (?, ?) ON CONFLICT (id) DO UPDATE SET v = excluded.v",
                &params(&["k", "v2"]),
            )
            .unwrap();

        let rows = session.query("SELECT id, v FROM t", &[], 2).unwrap();
        assert_eq!(
            rows,
            vec![vec![Some("k".to_string()), Some("v2".to_string())]]
        );
        assert_eq!(
            session.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap(),
            Some("1".to_string())
        );
    }

    #[test]
    fn test_ping() {
        let mut session = DuckDbSession::open_in_memory().unwrap();
        assert!(session.ping());
    }

    #[test]
    fn test_sessions_use_the_driver_scope() {
        let dir = tempfile::tempdir().unwrap();
        let library_path = dir.path().join("duckdb_jdbc-1.1.3.jar");
        std::fs::write(&library_path, b"jar").unwrap();
        let adapter = DuckDbAdapter::new(DriverHandle {
            backend: BackendKind::EmbeddedMemory,
            library: "duckdb".to_string(),
            entry_point: "hoststore.libs.duckdb.DuckDBDriver".to_string(),
            library_path,
        });

        let mut session = adapter
            .open_session(&ConnectionConfig::embedded_memory())
            .unwrap();
        let setting = session
            .query_scalar(
                "SELECT value FROM duckdb_settings() WHERE name = 'extension_directory'",
                &[],
            )
            .unwrap();
        assert_eq!(
            setting,
            Some(dir.path().join("extensions").display().to_string())
        );
        session.close();
    }
}
