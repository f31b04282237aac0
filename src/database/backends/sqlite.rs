//! Embedded-file backend (SQLite)

use std::path::Path;
use std::time::Duration;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{ffi, params_from_iter, Connection};
use tracing::debug;

use crate::database::backends::Adapter;
use crate::database::core::{BackendKind, ConnectionConfig, Param, Row, Session};
use crate::error::{ConnectionError, QueryError};

pub struct SqliteAdapter;

impl Adapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::EmbeddedFile
    }

    fn open_session(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>, ConnectionError> {
        let session = match &config.path {
            Some(path) => SqliteSession::open(path, config.acquire_timeout)?,
            None => SqliteSession::open_in_memory()?,
        };
        Ok(Box::new(session))
    }
}

/// SQLite connection configured for a single long-lived writer
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    /// Open (creating if needed) the store file at `path`
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, ConnectionError> {
        let unreachable = |reason: String| ConnectionError::Unreachable {
            backend: BackendKind::EmbeddedFile,
            target: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| unreachable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| unreachable(e.to_string()))?;
        let session = SqliteSession { conn };
        session
            .configure(busy_timeout)
            .map_err(|e| unreachable(e.to_string()))?;
        debug!("opened SQLite store at {}", path.display());
        Ok(session)
    }

    pub fn open_in_memory() -> Result<Self, ConnectionError> {
        let conn = Connection::open_in_memory().map_err(|e| ConnectionError::Unreachable {
            backend: BackendKind::EmbeddedFile,
            target: ":memory:".to_string(),
            reason: e.to_string(),
        })?;
        let session = SqliteSession { conn };
        session
            .configure(Duration::from_secs(5))
            .map_err(|e| ConnectionError::Unreachable {
                backend: BackendKind::EmbeddedFile,
                target: ":memory:".to_string(),
                reason: e.to_string(),
            })?;
        Ok(session)
    }

    fn configure(&self, busy_timeout: Duration) -> rusqlite::Result<()> {
        // WAL lets readers in other processes proceed while we write
        let _: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        self.conn.execute_batch("PRAGMA synchronous=NORMAL")?;
        self.conn.execute_batch("PRAGMA temp_store=MEMORY")?;
        // key prefix scans use LIKE and must match case exactly
        self.conn.execute_batch("PRAGMA case_sensitive_like=ON")?;
        self.conn.busy_timeout(busy_timeout)?;
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

fn text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn classify(e: rusqlite::Error) -> QueryError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked
            ) =>
        {
            QueryError::Transient(e.to_string())
        }
        _ => QueryError::Database(e.to_string()),
    }
}

impl Session for SqliteSession {
    fn backend(&self) -> BackendKind {
        BackendKind::EmbeddedFile
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
                values.push(text(row.get_ref(i).map_err(classify)?));
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
            debug!("error closing SQLite connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{params, SessionExt};
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let mut session = SqliteSession::open_in_memory().unwrap();
        assert!(session.ping());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/data.db");
        let session = SqliteSession::open(&path, Duration::from_secs(1)).unwrap();
        assert!(path.exists());
        Box::new(session).close();
    }

    #[test]
    fn test_text_round_trip_and_nulls() {
        let mut session = SqliteSession::open_in_memory().unwrap();
        session
            .execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY, v TEXT)")
            .unwrap();
        session
            .execute("INSERT INTO t (id, v) VALUES (?1, ?2)", &params(&["a", "1"]))
            .unwrap();
        session
            .execute(
                "INSERT INTO t (id, v) VALUES (?1, ?2)",
                &[Some("b".to_string()), None],
            )
            .unwrap();

        let rows = session
            .query("SELECT id, v FROM t ORDER BY id", &[], 2)
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("a".to_string()), Some("1".to_string())],
                vec![Some("b".to_string()), None],
            ]
        );
        assert_eq!(
            session.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap(),
            Some("2".to_string())
        );
    }

    #[test]
    fn test_constraint_violation_is_not_transient() {
        let mut session = SqliteSession::open_in_memory().unwrap();
        session
            .execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY)")
            .unwrap();
        session
            .execute("INSERT INTO t (id) VALUES (?1)", &params(&["a"]))
            .unwrap();
        let err = session
            .execute("INSERT INTO t (id) VALUES (?1)", &params(&["a"]))
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
