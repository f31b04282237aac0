//! Store transfer
//!
//! Copies every application table of one store into another, e.g. when an
//! operator switches from the embedded file to a networked server. The flow is
//! driven by a pending `storage-new.toml` next to the active `storage.toml`:
//! once the copy finishes, the active file is kept as `storage-old.toml` and
//! the pending one takes its place.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::database::core::BackendKind;
use crate::database::manager::StorageManager;
use crate::error::StorageError;

pub const STORAGE_FILE: &str = "storage.toml";
pub const PENDING_STORAGE_FILE: &str = "storage-new.toml";
pub const PREVIOUS_STORAGE_FILE: &str = "storage-old.toml";

#[derive(Debug, Clone, Serialize)]
pub struct TableTransfer {
    pub table: String,
    pub rows: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub source: BackendKind,
    pub target: BackendKind,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub tables: Vec<TableTransfer>,
    /// Rows written to the target
    pub rows: usize,
    /// `table/key: error` for every row the target refused
    pub failures: Vec<String>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Copy all rows of `source` into `target`
///
/// Missing tables and columns are created in `target`; rows are upserted so a
/// repeated transfer converges. A row the target refuses is logged and
/// skipped.
pub fn copy_store(
    source: &StorageManager,
    target: &StorageManager,
) -> Result<TransferReport, StorageError> {
    let started_at = Utc::now();
    let started = Instant::now();
    let mut tables = vec![];
    let mut failures = vec![];
    let mut total = 0;

    let source_tables = source.tables()?;
    if source_tables.is_empty() {
        warn!("{} store has no tables to transfer", source.kind());
    }

    for table in source_tables {
        let columns = source.columns(&table)?;
        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        target.ensure_table(&table, &column_refs)?;

        let mut copied = TableTransfer {
            table: table.clone(),
            rows: 0,
            failed: 0,
        };
        for record in source.scan(&table, None, None)? {
            let values: Vec<(&str, Option<&str>)> = record
                .values
                .iter()
                .map(|(c, v)| (c.as_str(), v.as_deref()))
                .collect();
            match target.upsert(&table, &record.key, &values) {
                Ok(()) => copied.rows += 1,
                Err(e) => {
                    error!("failed to transfer {}/{}: {}", table, record.key, e.chain());
                    failures.push(format!("{}/{}: {}", table, record.key, e.chain()));
                    copied.failed += 1;
                }
            }
        }
        total += copied.rows;
        tables.push(copied);
    }

    Ok(TransferReport {
        source: source.kind(),
        target: target.kind(),
        started_at,
        elapsed_ms: started.elapsed().as_millis(),
        tables,
        rows: total,
        failures,
    })
}

/// Pending storage configuration in `dir`, if an operator left one
pub fn pending_storage_file(dir: &Path) -> Option<PathBuf> {
    let pending = dir.join(PENDING_STORAGE_FILE);
    pending.is_file().then_some(pending)
}

/// Make the pending storage file the active one
///
/// `storage.toml` becomes `storage-old.toml` (replacing an older one) and
/// `storage-new.toml` becomes `storage.toml`.
pub fn rotate_storage_files(dir: &Path) -> Result<(), StorageError> {
    let active = dir.join(STORAGE_FILE);
    let pending = dir.join(PENDING_STORAGE_FILE);
    let previous = dir.join(PREVIOUS_STORAGE_FILE);

    let io = |what: &str, e: std::io::Error| StorageError::Config(format!("{}: {}", what, e));

    if previous.exists() {
        fs::remove_file(&previous).map_err(|e| io("failed to remove storage-old.toml", e))?;
    }
    if active.exists() {
        fs::rename(&active, &previous).map_err(|e| {
            io(
                "failed to rename storage.toml to storage-old.toml; rename it and storage-new.toml manually",
                e,
            )
        })?;
    }
    fs::rename(&pending, &active).map_err(|e| {
        io(
            "failed to rename storage-new.toml to storage.toml; rename it manually",
            e,
        )
    })?;
    info!("{} is now the active storage configuration", active.display());
    Ok(())
}
