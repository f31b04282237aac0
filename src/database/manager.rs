//! Storage manager
//!
//! Owns the adapter and connection pool for the configured backend, drives the
//! lifecycle state machine and exposes the backend-agnostic query surface.
//!
//! ```text
//! Uninitialized → Provisioning → Connecting → Migrating → Ready → Closing → Closed
//!                      │              │            │
//!                      └──────────────┴────────────┴──→ Failed
//! ```
//!
//! Every query call borrows a session for the duration of the call only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::backends::{adapter_for, Adapter};
use crate::database::core::{
    identifier, like_prefix, BackendKind, ConnectionConfig, ConnectionPool,
    DrainReport, Migration, Operation, Param, SchemaManager, Session, KEY_COLUMN, MAX_KEY_LEN,
    META_TABLE,
};
use crate::database::transfer::{copy_store, TransferReport};
use crate::error::{ConnectionError, QueryError, StorageError};
use crate::libraries::{DriverHandle, Provisioner};

/// Attempts made by read operations on transient failures
const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(50);

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    Uninitialized,
    Provisioning,
    Connecting,
    Migrating,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl StorageState {
    pub fn name(&self) -> &'static str {
        match self {
            StorageState::Uninitialized => "uninitialized",
            StorageState::Provisioning => "provisioning",
            StorageState::Connecting => "connecting",
            StorageState::Migrating => "migrating",
            StorageState::Ready => "ready",
            StorageState::Closing => "closing",
            StorageState::Closed => "closed",
            StorageState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StorageState::Closed | StorageState::Failed)
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything about a store that is not connection parameters
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Prepended to every physical table name, including the meta table
    pub table_prefix: String,
    /// Logical table name → value columns, ensured after migration
    pub tables: BTreeMap<String, Vec<String>>,
    pub migrations: Vec<Migration>,
    pub shutdown_timeout: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            table_prefix: String::new(),
            tables: BTreeMap::new(),
            migrations: vec![],
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl StorageSettings {
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.table_prefix = prefix.to_string();
        self
    }

    pub fn with_table(mut self, table: &str, columns: &[&str]) -> Self {
        self.tables.insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// One row: key plus column → value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub key: String,
    pub values: BTreeMap<String, Option<String>>,
}

impl Record {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }
}

/// Backend-agnostic persistence for one configured store
pub struct StorageManager {
    config: ConnectionConfig,
    settings: StorageSettings,
    state: RwLock<StorageState>,
    failure: Mutex<Option<StorageError>>,
    adapter: RwLock<Option<Arc<dyn Adapter>>>,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    /// Logical table → value columns, as found in the store
    catalog: RwLock<BTreeMap<String, Vec<String>>>,
    schema_version: AtomicU32,
}

impl StorageManager {
    pub fn new(config: ConnectionConfig, settings: StorageSettings) -> Self {
        StorageManager {
            config,
            settings,
            state: RwLock::new(StorageState::Uninitialized),
            failure: Mutex::new(None),
            adapter: RwLock::new(None),
            pool: RwLock::new(None),
            catalog: RwLock::new(BTreeMap::new()),
            schema_version: AtomicU32::new(0),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.config.kind
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> StorageState {
        *self.state.read()
    }

    /// Cause of the transition into [`StorageState::Failed`]
    pub fn failure(&self) -> Option<StorageError> {
        self.failure.lock().clone()
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version.load(Ordering::SeqCst)
    }

    /// Live driver connections, idle or borrowed
    pub fn open_connections(&self) -> usize {
        self.pool
            .read()
            .as_ref()
            .map(|p| p.open_connections())
            .unwrap_or(0)
    }

    fn set_state(&self, state: StorageState) {
        debug!("{} storage: {} → {}", self.config.kind, self.state(), state);
        *self.state.write() = state;
    }

    fn fail(&self, error: StorageError) -> StorageError {
        warn!("{} storage failed: {}", self.config.kind, error.chain());
        if let Some(pool) = self.pool.write().take() {
            pool.drain(Duration::ZERO);
        }
        *self.failure.lock() = Some(error.clone());
        self.set_state(StorageState::Failed);
        error
    }

    fn begin_start(&self) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if *state != StorageState::Uninitialized {
            return Err(StorageError::NotReady {
                state: state.name().to_string(),
            });
        }
        *state = StorageState::Provisioning;
        Ok(())
    }

    /// Provision the driver (if any), connect and migrate
    ///
    /// Engines backed by an optional library need `provisioner`; built-in
    /// engines accept `None`.
    pub fn start(&self, provisioner: Option<&Provisioner>) -> Result<(), StorageError> {
        self.begin_start()?;
        let driver = match (self.config.kind.required_library(), provisioner) {
            (None, _) => None,
            (Some(_), Some(p)) => match p.driver_for(self.config.kind) {
                Ok(driver) => driver,
                Err(e) => return Err(self.fail(e.into())),
            },
            (Some(library), None) => {
                return Err(self.fail(StorageError::Config(format!(
                    "{} storage needs library {} but no provisioner is available",
                    self.config.kind, library
                ))))
            }
        };
        self.connect_and_migrate(driver)
    }

    /// Start with an already provisioned driver
    pub fn start_with_driver(&self, driver: Option<DriverHandle>) -> Result<(), StorageError> {
        self.begin_start()?;
        self.connect_and_migrate(driver)
    }

    fn connect_and_migrate(&self, driver: Option<DriverHandle>) -> Result<(), StorageError> {
        self.set_state(StorageState::Connecting);
        let adapter = match self.build_adapter(driver) {
            Ok(adapter) => adapter,
            Err(e) => return Err(self.fail(e)),
        };
        self.open_with(adapter)
    }

    fn build_adapter(&self, driver: Option<DriverHandle>) -> Result<Arc<dyn Adapter>, StorageError> {
        self.config.validate()?;
        Ok(Arc::from(adapter_for(self.config.kind, driver)?))
    }

    /// Connect through `adapter`, then bring the schema up to date
    fn open_with(&self, adapter: Arc<dyn Adapter>) -> Result<(), StorageError> {
        let pool = match self.connect(adapter) {
            Ok(pool) => pool,
            Err(e) => return Err(self.fail(e)),
        };
        *self.pool.write() = Some(Arc::clone(&pool));

        self.set_state(StorageState::Migrating);
        if let Err(e) = self.migrate(&pool) {
            return Err(self.fail(e));
        }

        info!(
            "{} storage ready at {} (schema v{}, {} tables)",
            self.config.kind,
            self.config.target(),
            self.schema_version(),
            self.catalog.read().len()
        );
        self.set_state(StorageState::Ready);
        Ok(())
    }

    fn connect(&self, adapter: Arc<dyn Adapter>) -> Result<Arc<ConnectionPool>, StorageError> {
        *self.adapter.write() = Some(Arc::clone(&adapter));

        let config = self.config.clone();
        let opener_adapter = Arc::clone(&adapter);
        let pool = Arc::new(ConnectionPool::new(
            self.config.kind,
            self.config.effective_pool_size(),
            self.config.acquire_timeout,
            Box::new(move || opener_adapter.open_session(&config)),
        ));

        // open one session up front so connection failures surface here
        let mut session = pool.acquire()?;
        if !session.ping() {
            session.mark_broken();
            return Err(ConnectionError::Unreachable {
                backend: self.config.kind,
                target: self.config.target(),
                reason: "no answer to a ping".to_string(),
            }
            .into());
        }
        Ok(pool)
    }

    fn migrate(&self, pool: &ConnectionPool) -> Result<(), StorageError> {
        let mut session = pool.acquire()?;
        let prefix = self.settings.table_prefix.as_str();
        let mut schema = SchemaManager::new(&mut *session, prefix);

        let outcome = schema.migrate(&self.settings.migrations)?;
        if !outcome.applied.is_empty() {
            info!(
                "migrated {} storage from v{} to v{}",
                self.config.kind, outcome.from, outcome.to
            );
        }
        schema.ensure_declared(&self.settings.tables)?;
        self.schema_version.store(schema.schema_version()?, Ordering::SeqCst);
        drop(schema);

        let catalog = load_catalog(&mut *session, prefix)?;
        *self.catalog.write() = catalog;
        Ok(())
    }

    /// Reject new calls, wait for borrowed sessions up to the shutdown
    /// timeout, then close everything
    pub fn shutdown(&self) -> DrainReport {
        self.shutdown_within(self.settings.shutdown_timeout)
    }

    pub fn shutdown_within(&self, timeout: Duration) -> DrainReport {
        {
            let mut state = self.state.write();
            if state.is_terminal() || *state == StorageState::Closing {
                return DrainReport {
                    closed: 0,
                    forced: 0,
                };
            }
            *state = StorageState::Closing;
        }

        let report = match self.pool.write().take() {
            Some(pool) => pool.drain(timeout),
            None => DrainReport {
                closed: 0,
                forced: 0,
            },
        };
        info!(
            "{} storage closed ({} sessions closed, {} force-closed)",
            self.config.kind, report.closed, report.forced
        );
        self.set_state(StorageState::Closed);
        report
    }

    fn ready_pool(&self) -> Result<Arc<ConnectionPool>, StorageError> {
        let state = self.state();
        if state != StorageState::Ready {
            return Err(StorageError::NotReady {
                state: state.name().to_string(),
            });
        }
        self.pool
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::NotReady {
                state: state.name().to_string(),
            })
    }

    /// Statement text for `op`, rendered by the active adapter
    fn render(&self, op: &Operation<'_>) -> Result<String, StorageError> {
        let adapter = self
            .adapter
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| StorageError::NotReady {
                state: self.state().name().to_string(),
            })?;
        Ok(adapter.dialect_for(op)?)
    }

    /// Run `f` on a borrowed session
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut dyn Session) -> Result<T, QueryError>,
    ) -> Result<T, StorageError> {
        let pool = self.ready_pool()?;
        let mut session = pool.acquire()?;
        match f(&mut *session) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_transient() && !session.ping() {
                    session.mark_broken();
                }
                Err(e.into())
            }
        }
    }

    /// Like [`Self::with_session`], retrying transient failures
    fn with_read_session<T>(
        &self,
        f: impl Fn(&mut dyn Session) -> Result<T, QueryError>,
    ) -> Result<T, StorageError> {
        let mut attempt = 1;
        loop {
            match self.with_session(&f) {
                Err(StorageError::Query(e)) if e.is_transient() && attempt < READ_ATTEMPTS => {
                    let delay = READ_BACKOFF * 2u32.pow(attempt - 1);
                    debug!("transient read failure ({}), retrying in {:?}", e, delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Physical name and value columns of a logical table
    fn table(&self, table: &str) -> Result<(String, Vec<String>), StorageError> {
        let logical = identifier(table)?;
        let columns = self
            .catalog
            .read()
            .get(&logical)
            .cloned()
            .ok_or_else(|| QueryError::UnknownTable(table.to_string()))?;
        let physical = identifier(&format!("{}{}", self.settings.table_prefix, logical))?;
        Ok((physical, columns))
    }

    /// Row keys are non-empty and fit the narrowest key column of any backend
    fn key(key: &str) -> Result<Param, StorageError> {
        if key.is_empty() {
            return Err(QueryError::InvalidKey("key is empty".to_string()).into());
        }
        let len = key.chars().count();
        if len > MAX_KEY_LEN {
            return Err(QueryError::InvalidKey(format!(
                "{} characters, at most {} allowed",
                len, MAX_KEY_LEN
            ))
            .into());
        }
        Ok(Some(key.to_string()))
    }

    fn column(&self, table: &str, known: &[String], column: &str) -> Result<String, StorageError> {
        let column = identifier(column)?;
        if known.contains(&column) {
            Ok(column)
        } else {
            Err(QueryError::UnknownColumn {
                table: table.to_string(),
                column,
            }
            .into())
        }
    }

    fn assignments(
        &self,
        table: &str,
        known: &[String],
        values: &[(&str, Option<&str>)],
    ) -> Result<(Vec<String>, Vec<Param>), StorageError> {
        let mut columns = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len());
        for (column, value) in values {
            let column = self.column(table, known, column)?;
            if columns.contains(&column) {
                return Err(QueryError::Database(format!(
                    "column '{}' given twice",
                    column
                ))
                .into());
            }
            columns.push(column);
            params.push(value.map(str::to_string));
        }
        Ok((columns, params))
    }

    fn to_record(columns: &[String], row: Vec<Option<String>>) -> Record {
        let mut row = row.into_iter();
        let key = row.next().flatten().unwrap_or_default();
        Record {
            key,
            values: columns.iter().cloned().zip(row).collect(),
        }
    }

    /// Logical names of the application tables
    pub fn tables(&self) -> Result<Vec<String>, StorageError> {
        self.ready_pool()?;
        Ok(self.catalog.read().keys().cloned().collect())
    }

    /// Value columns of `table`
    pub fn columns(&self, table: &str) -> Result<Vec<String>, StorageError> {
        self.ready_pool()?;
        Ok(self.table(table)?.1)
    }

    /// Create `table` or add whichever of `columns` are missing
    pub fn ensure_table(&self, table: &str, columns: &[&str]) -> Result<(), StorageError> {
        let logical = identifier(table)?;
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let prefix = self.settings.table_prefix.clone();
        let catalog = self.with_session(|s| {
            let mut schema = SchemaManager::new(s, &prefix);
            schema.ensure_table(&logical, &columns)?;
            drop(schema);
            load_catalog(s, &prefix)
        })?;
        *self.catalog.write() = catalog;
        Ok(())
    }

    /// Insert a new row; fails when `key` already exists
    pub fn create(
        &self,
        table: &str,
        key: &str,
        values: &[(&str, Option<&str>)],
    ) -> Result<(), StorageError> {
        let (physical, known) = self.table(table)?;
        let (columns, mut params) = self.assignments(table, &known, values)?;
        let sql = self.render(&Operation::Insert {
            table: &physical,
            columns: &columns,
        })?;
        params.insert(0, Self::key(key)?);
        self.with_session(|s| s.execute(&sql, &params)).map(|_| ())
    }

    /// Insert or overwrite the given columns of `key`
    pub fn upsert(
        &self,
        table: &str,
        key: &str,
        values: &[(&str, Option<&str>)],
    ) -> Result<(), StorageError> {
        let (physical, known) = self.table(table)?;
        let (columns, mut params) = self.assignments(table, &known, values)?;
        let sql = self.render(&Operation::Upsert {
            table: &physical,
            columns: &columns,
        })?;
        params.insert(0, Self::key(key)?);
        self.with_session(|s| s.execute(&sql, &params)).map(|_| ())
    }

    /// Overwrite the given columns of an existing row; `false` when no row
    /// matched
    pub fn update(
        &self,
        table: &str,
        key: &str,
        values: &[(&str, Option<&str>)],
    ) -> Result<bool, StorageError> {
        let (physical, known) = self.table(table)?;
        let (columns, mut params) = self.assignments(table, &known, values)?;
        let sql = self.render(&Operation::Update {
            table: &physical,
            columns: &columns,
        })?;
        params.push(Self::key(key)?);
        self.with_session(|s| s.execute(&sql, &params))
            .map(|n| n > 0)
    }

    pub fn read(&self, table: &str, key: &str) -> Result<Option<Record>, StorageError> {
        let (physical, columns) = self.table(table)?;
        let sql = self.render(&Operation::SelectByKey {
            table: &physical,
            columns: &columns,
        })?;
        let params = [Self::key(key)?];
        let rows = self.with_read_session(|s| s.query(&sql, &params, columns.len() + 1))?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| Self::to_record(&columns, row)))
    }

    /// Single value of `key`; `None` when the row is absent or the value NULL
    pub fn read_value(
        &self,
        table: &str,
        key: &str,
        column: &str,
    ) -> Result<Option<String>, StorageError> {
        let (physical, known) = self.table(table)?;
        let column = self.column(table, &known, column)?;
        let columns = [column];
        let sql = self.render(&Operation::SelectByKey {
            table: &physical,
            columns: &columns,
        })?;
        let params = [Self::key(key)?];
        let rows = self.with_read_session(|s| s.query(&sql, &params, 2))?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().nth(1).flatten()))
    }

    /// Remove the row of `key`; `false` when there was none
    pub fn delete(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        let (physical, _) = self.table(table)?;
        let sql = self.render(&Operation::DeleteByKey { table: &physical })?;
        let params = [Self::key(key)?];
        self.with_session(|s| s.execute(&sql, &params))
            .map(|n| n > 0)
    }

    /// Set one column of `key` to NULL
    pub fn clear_value(&self, table: &str, key: &str, column: &str) -> Result<bool, StorageError> {
        let (physical, known) = self.table(table)?;
        let column = self.column(table, &known, column)?;
        let sql = self.render(&Operation::ClearColumn {
            table: &physical,
            column: &column,
        })?;
        let params = [Self::key(key)?];
        self.with_session(|s| s.execute(&sql, &params))
            .map(|n| n > 0)
    }

    /// Rows ordered by key, optionally limited to keys starting with
    /// `prefix`
    pub fn scan(
        &self,
        table: &str,
        prefix: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>, StorageError> {
        let (physical, columns) = self.table(table)?;
        let sql = self.render(&Operation::Scan {
            table: &physical,
            columns: &columns,
            prefix_filter: prefix.is_some(),
            limit,
        })?;
        let params: Vec<Param> = prefix.map(|p| Some(like_prefix(p))).into_iter().collect();
        let rows = self.with_read_session(|s| s.query(&sql, &params, columns.len() + 1))?;
        Ok(rows
            .into_iter()
            .map(|row| Self::to_record(&columns, row))
            .collect())
    }

    /// Every key of `table`, ordered
    pub fn keys(&self, table: &str) -> Result<Vec<String>, StorageError> {
        let (physical, _) = self.table(table)?;
        let sql = self.render(&Operation::Scan {
            table: &physical,
            columns: &[],
            prefix_filter: false,
            limit: None,
        })?;
        let rows = self.with_read_session(|s| s.query(&sql, &[], 1))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    /// Copy every application table of this store into `target`
    pub fn transfer_to(&self, target: &StorageManager) -> Result<TransferReport, StorageError> {
        let started = Instant::now();
        let report = copy_store(self, target)?;
        info!(
            "transferred {} rows in {} tables from {} to {} in {:?}",
            report.rows,
            report.tables.len(),
            self.config.kind,
            target.config.kind,
            started.elapsed()
        );
        Ok(report)
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            pool.drain(Duration::ZERO);
        }
    }
}

/// Application tables under `prefix`, meta table excluded
fn load_catalog(
    session: &mut dyn Session,
    prefix: &str,
) -> Result<BTreeMap<String, Vec<String>>, QueryError> {
    let mut schema = SchemaManager::new(session, prefix);
    let meta = schema.meta_table()?;
    let mut catalog = BTreeMap::new();
    for physical in schema.tables()? {
        if physical == meta {
            continue;
        }
        let Some(logical) = physical.strip_prefix(prefix) else {
            continue;
        };
        if logical.is_empty() || logical == META_TABLE {
            continue;
        }
        let columns = schema
            .columns(&physical)?
            .into_iter()
            .filter(|c| c != KEY_COLUMN)
            .collect();
        catalog.insert(logical.to_string(), columns);
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::backends::SqliteAdapter;
    use crate::database::core::Row;
    use crate::error::ResourceError;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::tempdir;

    /// Fault switches shared by every session a [`Flaky`] adapter opens
    #[derive(Default)]
    struct Faults {
        /// Upcoming statements that fail with a transient error
        fail_next: AtomicUsize,
        failed: AtomicUsize,
        ping_fails: AtomicBool,
        opened: AtomicUsize,
    }

    impl Faults {
        fn trip(&self) -> Result<(), QueryError> {
            let armed = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if armed {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return Err(QueryError::Transient("connection reset".to_string()));
            }
            Ok(())
        }
    }

    /// SQLite sessions that fail on demand
    struct Flaky {
        faults: Arc<Faults>,
    }

    struct FlakySession {
        inner: Box<dyn Session>,
        faults: Arc<Faults>,
    }

    impl Adapter for Flaky {
        fn kind(&self) -> BackendKind {
            BackendKind::EmbeddedFile
        }

        fn open_session(
            &self,
            config: &ConnectionConfig,
        ) -> Result<Box<dyn Session>, ConnectionError> {
            self.faults.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakySession {
                inner: SqliteAdapter.open_session(config)?,
                faults: Arc::clone(&self.faults),
            }))
        }
    }

    impl Session for FlakySession {
        fn backend(&self) -> BackendKind {
            self.inner.backend()
        }
        fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64, QueryError> {
            self.faults.trip()?;
            self.inner.execute(sql, params)
        }
        fn query(
            &mut self,
            sql: &str,
            params: &[Param],
            columns: usize,
        ) -> Result<Vec<Row>, QueryError> {
            self.faults.trip()?;
            self.inner.query(sql, params, columns)
        }
        fn execute_batch(&mut self, sql: &str) -> Result<(), QueryError> {
            self.inner.execute_batch(sql)
        }
        fn ping(&mut self) -> bool {
            !self.faults.ping_fails.load(Ordering::SeqCst)
        }
        fn close(self: Box<Self>) {
            self.inner.close()
        }
    }

    fn open_flaky(
        dir: &std::path::Path,
        faults: &Arc<Faults>,
    ) -> (StorageManager, Result<(), StorageError>) {
        let config = ConnectionConfig::embedded_file(dir.join("data.db"));
        let manager = StorageManager::new(config, settings());
        manager.begin_start().unwrap();
        let result = manager.open_with(Arc::new(Flaky {
            faults: Arc::clone(faults),
        }));
        (manager, result)
    }

    fn settings() -> StorageSettings {
        StorageSettings::default()
            .with_prefix("test_")
            .with_table("players", &["name", "score"])
            .with_migrations(vec![Migration::new(1, "homes").create_table("homes", &["world", "x"])])
    }

    fn started(dir: &std::path::Path) -> StorageManager {
        let config = ConnectionConfig::embedded_file(dir.join("data.db"));
        let manager = StorageManager::new(config, settings());
        manager.start(None).unwrap();
        manager
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempdir().unwrap();
        let config = ConnectionConfig::embedded_file(dir.path().join("data.db"));
        let manager = StorageManager::new(config, settings());
        assert_eq!(manager.state(), StorageState::Uninitialized);
        assert!(matches!(
            manager.tables(),
            Err(StorageError::NotReady { .. })
        ));

        manager.start(None).unwrap();
        assert_eq!(manager.state(), StorageState::Ready);
        assert_eq!(manager.schema_version(), 1);
        assert_eq!(manager.open_connections(), 1);
        assert_eq!(manager.tables().unwrap(), vec!["homes", "players"]);

        let report = manager.shutdown();
        assert_eq!(report.forced, 0);
        assert_eq!(manager.state(), StorageState::Closed);
        assert_eq!(manager.open_connections(), 0);
        assert!(matches!(
            manager.read("players", "a"),
            Err(StorageError::NotReady { .. })
        ));

        // second start is refused
        assert!(manager.start(None).is_err());
    }

    #[test]
    fn test_crud() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());

        manager
            .create("players", "alice", &[("name", Some("Alice")), ("score", Some("10"))])
            .unwrap();
        assert!(manager.create("players", "alice", &[]).is_err());

        let record = manager.read("players", "alice").unwrap().unwrap();
        assert_eq!(record.key, "alice");
        assert_eq!(record.get("name"), Some("Alice"));
        assert_eq!(
            manager.read_value("players", "alice", "score").unwrap(),
            Some("10".to_string())
        );

        assert!(manager
            .update("players", "alice", &[("score", Some("11"))])
            .unwrap());
        assert!(!manager
            .update("players", "nobody", &[("score", Some("1"))])
            .unwrap());
        assert_eq!(
            manager.read_value("players", "alice", "score").unwrap(),
            Some("11".to_string())
        );

        manager
            .upsert("players", "bob", &[("name", Some("Bob"))])
            .unwrap();
        manager
            .upsert("players", "bob", &[("score", Some("3"))])
            .unwrap();
        let bob = manager.read("players", "bob").unwrap().unwrap();
        assert_eq!(bob.get("name"), Some("Bob"));
        assert_eq!(bob.get("score"), Some("3"));

        assert!(manager.clear_value("players", "bob", "name").unwrap());
        assert_eq!(manager.read_value("players", "bob", "name").unwrap(), None);

        assert_eq!(manager.keys("players").unwrap(), vec!["alice", "bob"]);
        assert!(manager.delete("players", "alice").unwrap());
        assert!(!manager.delete("players", "alice").unwrap());
        assert_eq!(manager.read("players", "alice").unwrap(), None);
        manager.shutdown();
    }

    #[test]
    fn test_scan_with_prefix_and_limit() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());
        for key in ["a_1", "a_2", "a%3", "b_1", "ab"] {
            manager
                .upsert("players", key, &[("name", Some(key))])
                .unwrap();
        }

        let keys = |records: Vec<Record>| records.into_iter().map(|r| r.key).collect::<Vec<_>>();
        assert_eq!(
            keys(manager.scan("players", Some("a_"), None).unwrap()),
            vec!["a_1", "a_2"]
        );
        assert_eq!(
            keys(manager.scan("players", Some("a%"), None).unwrap()),
            vec!["a%3"]
        );
        assert_eq!(
            keys(manager.scan("players", None, Some(2)).unwrap()),
            vec!["a%3", "a_1"]
        );
        manager.shutdown();
    }

    #[test]
    fn test_scan_prefix_is_case_sensitive() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());
        for key in ["Alice", "alice", "ALX", "al"] {
            manager.upsert("players", key, &[]).unwrap();
        }

        let keys: Vec<String> = manager
            .scan("players", Some("al"), None)
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["al", "alice"]);
        assert!(manager.read("players", "ALICE").unwrap().is_none());
        manager.shutdown();
    }

    #[test]
    fn test_keys_are_bounded() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());
        let longest = "k".repeat(MAX_KEY_LEN);
        manager.upsert("players", &longest, &[]).unwrap();
        assert_eq!(manager.keys("players").unwrap(), vec![longest.clone()]);

        let too_long = format!("{}k", longest);
        for result in [
            manager.upsert("players", &too_long, &[]).map(|_| true),
            manager.create("players", &too_long, &[]).map(|_| true),
            manager.read("players", &too_long).map(|r| r.is_some()),
            manager.delete("players", &too_long),
            manager.upsert("players", "", &[]).map(|_| true),
        ] {
            assert!(matches!(
                result,
                Err(StorageError::Query(QueryError::InvalidKey(_)))
            ));
        }
        // characters, not bytes
        manager.upsert("players", &"é".repeat(MAX_KEY_LEN), &[]).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());
        assert!(matches!(
            manager.read("missing", "k"),
            Err(StorageError::Query(QueryError::UnknownTable(_)))
        ));
        assert!(matches!(
            manager.read_value("players", "k", "missing"),
            Err(StorageError::Query(QueryError::UnknownColumn { .. }))
        ));
        assert!(matches!(
            manager.read("players; drop table x", "k"),
            Err(StorageError::Query(QueryError::InvalidIdentifier(_)))
        ));
        // the meta table is not part of the query surface
        assert!(manager.read("hoststore_meta", "schema_version").is_err());
        manager.shutdown();
    }

    #[test]
    fn test_ensure_table_extends_catalog() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());
        manager.ensure_table("warps", &["location"]).unwrap();
        manager.ensure_table("players", &["name", "rank"]).unwrap();
        assert_eq!(manager.columns("players").unwrap(), vec!["name", "score", "rank"]);
        manager
            .upsert("warps", "spawn", &[("location", Some("0,64,0"))])
            .unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_restart_keeps_data_and_version() {
        let dir = tempdir().unwrap();
        let manager = started(dir.path());
        manager
            .upsert("homes", "alice", &[("world", Some("overworld"))])
            .unwrap();
        manager.shutdown();

        let manager = started(dir.path());
        assert_eq!(manager.schema_version(), 1);
        assert_eq!(
            manager.read_value("homes", "alice", "world").unwrap(),
            Some("overworld".to_string())
        );
        manager.shutdown();
    }

    #[test]
    fn test_newer_store_fails() {
        let dir = tempdir().unwrap();
        let config = ConnectionConfig::embedded_file(dir.path().join("data.db"));
        let newer = StorageManager::new(
            config.clone(),
            StorageSettings::default().with_migrations(vec![
                Migration::new(1, "a").create_table("a", &["v"]),
                Migration::new(2, "b").create_table("b", &["v"]),
            ]),
        );
        newer.start(None).unwrap();
        newer.shutdown();

        let older = StorageManager::new(
            config,
            StorageSettings::default()
                .with_migrations(vec![Migration::new(1, "a").create_table("a", &["v"])]),
        );
        assert!(older.start(None).is_err());
        assert_eq!(older.state(), StorageState::Failed);
        assert_eq!(older.open_connections(), 0);
        assert!(matches!(
            older.failure(),
            Some(StorageError::Migration(
                crate::error::MigrationError::NewerStore { found: 2, supported: 1 }
            ))
        ));
    }

    #[test]
    fn test_reads_retry_transient_failures() {
        let dir = tempdir().unwrap();
        let faults = Arc::new(Faults::default());
        let (manager, started) = open_flaky(dir.path(), &faults);
        started.unwrap();
        manager
            .upsert("players", "p", &[("name", Some("Ann"))])
            .unwrap();

        faults.fail_next.store(2, Ordering::SeqCst);
        let record = manager.read("players", "p").unwrap().unwrap();
        assert_eq!(record.get("name"), Some("Ann"));
        assert_eq!(faults.failed.load(Ordering::SeqCst), 2);

        // gives up after the last attempt
        faults.failed.store(0, Ordering::SeqCst);
        faults.fail_next.store(10, Ordering::SeqCst);
        assert!(matches!(
            manager.keys("players"),
            Err(StorageError::Query(QueryError::Transient(_)))
        ));
        assert_eq!(faults.failed.load(Ordering::SeqCst), READ_ATTEMPTS as usize);
        faults.fail_next.store(0, Ordering::SeqCst);
        // the session answered its ping, so it was kept
        assert_eq!(faults.opened.load(Ordering::SeqCst), 1);
        manager.shutdown();
    }

    #[test]
    fn test_writes_are_not_retried() {
        let dir = tempdir().unwrap();
        let faults = Arc::new(Faults::default());
        let (manager, started) = open_flaky(dir.path(), &faults);
        started.unwrap();

        faults.fail_next.store(10, Ordering::SeqCst);
        assert!(matches!(
            manager.upsert("players", "p", &[("name", Some("Ann"))]),
            Err(StorageError::Query(QueryError::Transient(_)))
        ));
        assert!(manager.delete("players", "p").is_err());
        assert_eq!(faults.failed.load(Ordering::SeqCst), 2);

        faults.fail_next.store(0, Ordering::SeqCst);
        assert_eq!(manager.read("players", "p").unwrap(), None);
        manager.shutdown();
    }

    #[test]
    fn test_dead_session_is_replaced() {
        let dir = tempdir().unwrap();
        let faults = Arc::new(Faults::default());
        let (manager, started) = open_flaky(dir.path(), &faults);
        started.unwrap();
        assert_eq!(faults.opened.load(Ordering::SeqCst), 1);

        faults.ping_fails.store(true, Ordering::SeqCst);
        faults.fail_next.store(1, Ordering::SeqCst);
        assert!(manager.upsert("players", "p", &[]).is_err());
        assert_eq!(manager.open_connections(), 0);

        faults.ping_fails.store(false, Ordering::SeqCst);
        manager.upsert("players", "p", &[]).unwrap();
        assert_eq!(faults.opened.load(Ordering::SeqCst), 2);
        assert_eq!(manager.open_connections(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_silent_store_fails_to_connect() {
        let dir = tempdir().unwrap();
        let faults = Arc::new(Faults::default());
        faults.ping_fails.store(true, Ordering::SeqCst);
        let (manager, started) = open_flaky(dir.path(), &faults);
        assert!(matches!(
            started,
            Err(StorageError::Connection(ConnectionError::Unreachable { .. }))
        ));
        assert_eq!(manager.state(), StorageState::Failed);
        assert_eq!(manager.open_connections(), 0);
    }

    #[test]
    fn test_missing_driver_fails() {
        let manager = StorageManager::new(ConnectionConfig::embedded_memory(), settings());
        assert!(matches!(
            manager.start(None),
            Err(StorageError::Config(_))
        ));
        assert_eq!(manager.state(), StorageState::Failed);
    }

    #[test]
    fn test_shutdown_waits_for_borrowers() {
        let dir = tempdir().unwrap();
        let config = ConnectionConfig::embedded_file(dir.path().join("data.db"))
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(100));
        let manager = Arc::new(StorageManager::new(config, settings()));
        manager.start(None).unwrap();

        let pool = manager.ready_pool().unwrap();
        let borrowed = pool.acquire().unwrap();
        // pool of one: a second borrower times out
        assert!(matches!(
            manager.read("players", "x"),
            Err(StorageError::Resource(ResourceError::PoolExhausted { .. }))
        ));

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(borrowed);
        });
        let report = manager.shutdown_within(Duration::from_secs(5));
        releaser.join().unwrap();
        assert_eq!(report.forced, 0);
        assert_eq!(manager.open_connections(), 0);
        assert_eq!(pool.open_connections(), 0);
    }
}
