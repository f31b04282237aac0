//! Schema versioning and migration
//!
//! The store's schema version lives in the reserved `{prefix}hoststore_meta`
//! table, which is created before any application table is touched. Pending
//! [`Migration`] steps are applied in ascending version order. On engines with
//! transactional DDL each step runs inside one transaction; elsewhere the step
//! is bracketed by an in-progress marker so an interrupted run is detected on
//! the next startup.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::database::core::connection::{Param, Session, SessionExt};
use crate::database::core::dialect::{identifier, DialectTemplate, Operation};
use crate::error::{MigrationError, QueryError};

/// Unprefixed name of the reserved meta table
pub const META_TABLE: &str = "hoststore_meta";

const SCHEMA_VERSION_KEY: &str = "schema_version";
const IN_PROGRESS_KEY: &str = "migration_in_progress";

/// A single schema edit inside a migration step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// Create a table with a text key column and the given value columns.
    /// Missing columns are added when the table already exists.
    CreateTable { table: String, columns: Vec<String> },
    /// Add a value column when absent
    AddColumn { table: String, column: String },
    /// Engine-specific statement executed verbatim
    Raw(String),
}

/// One versioned schema step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    /// Whether re-applying a half-finished step is safe
    pub idempotent: bool,
    pub changes: Vec<SchemaChange>,
}

impl Migration {
    pub fn new(version: u32, description: &str) -> Self {
        Migration {
            version,
            description: description.to_string(),
            idempotent: true,
            changes: vec![],
        }
    }

    pub fn create_table(mut self, table: &str, columns: &[&str]) -> Self {
        self.changes.push(SchemaChange::CreateTable {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn add_column(mut self, table: &str, column: &str) -> Self {
        self.changes.push(SchemaChange::AddColumn {
            table: table.to_string(),
            column: column.to_string(),
        });
        self
    }

    /// Append a raw statement. Raw statements make the step non-idempotent
    /// unless [`Migration::idempotent`] says otherwise afterwards.
    pub fn raw(mut self, sql: &str) -> Self {
        self.changes.push(SchemaChange::Raw(sql.to_string()));
        self.idempotent = false;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// Highest version among `migrations`, or 0
pub fn target_version(migrations: &[Migration]) -> u32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Status of the store's schema relative to a set of migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// No meta table yet (fresh store)
    NotInitialized,

    /// Schema is at the target version
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// A previous run stopped in the middle of a step
    Interrupted { version: u32 },

    /// Store was written by a newer schema
    Incompatible {
        database_version: u32,
        required_version: u32,
    },
}

/// Result of a successful [`SchemaManager::migrate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<u32>,
}

/// Schema manager for one borrowed session
pub struct SchemaManager<'a> {
    session: &'a mut dyn Session,
    dialect: &'static DialectTemplate,
    prefix: &'a str,
}

impl<'a> SchemaManager<'a> {
    pub fn new(session: &'a mut dyn Session, prefix: &'a str) -> Self {
        let dialect = DialectTemplate::for_kind(session.backend());
        SchemaManager {
            session,
            dialect,
            prefix,
        }
    }

    /// Physical (prefixed, validated) name of a logical table
    pub fn physical(&self, table: &str) -> Result<String, QueryError> {
        identifier(&format!("{}{}", self.prefix, table))
    }

    pub fn meta_table(&self) -> Result<String, QueryError> {
        self.physical(META_TABLE)
    }

    pub fn ensure_meta_table(&mut self) -> Result<(), QueryError> {
        let table = self.meta_table()?;
        let sql = self
            .dialect
            .render(&Operation::CreateMetaTable { table: &table })?;
        self.session.execute_batch(&sql)
    }

    /// Every base table in the store, physical names
    pub fn tables(&mut self) -> Result<Vec<String>, QueryError> {
        let sql = self.dialect.render(&Operation::ListTables)?;
        Ok(self
            .session
            .query_column(&sql, &[])?
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect())
    }

    /// Columns of a physical table, in declaration order
    pub fn columns(&mut self, physical: &str) -> Result<Vec<String>, QueryError> {
        let sql = self.dialect.render(&Operation::ListColumns)?;
        Ok(self
            .session
            .query_column(&sql, &[Some(physical.to_string())])?
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect())
    }

    pub fn get_meta(&mut self, key: &str) -> Result<Option<String>, QueryError> {
        let table = self.meta_table()?;
        let sql = self.dialect.render(&Operation::SelectMeta { table: &table })?;
        self.session.query_scalar(&sql, &[Some(key.to_string())])
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<(), QueryError> {
        let table = self.meta_table()?;
        let sql = self.dialect.render(&Operation::UpsertMeta { table: &table })?;
        let params: [Param; 3] = [
            Some(key.to_string()),
            Some(value.to_string()),
            Some(Utc::now().to_rfc3339()),
        ];
        self.session.execute(&sql, &params)?;
        Ok(())
    }

    pub fn delete_meta(&mut self, key: &str) -> Result<(), QueryError> {
        let table = self.meta_table()?;
        let sql = self.dialect.render(&Operation::DeleteMeta { table: &table })?;
        self.session.execute(&sql, &[Some(key.to_string())])?;
        Ok(())
    }

    /// Recorded schema version; 0 for a fresh store
    pub fn schema_version(&mut self) -> Result<u32, QueryError> {
        match self.get_meta(SCHEMA_VERSION_KEY)? {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| QueryError::Database(format!("invalid schema version '{}'", v))),
            None => Ok(0),
        }
    }

    fn in_progress(&mut self) -> Result<Option<u32>, QueryError> {
        match self.get_meta(IN_PROGRESS_KEY)? {
            Some(v) => v.trim().parse().map(Some).map_err(|_| {
                QueryError::Database(format!("invalid migration marker '{}'", v))
            }),
            None => Ok(None),
        }
    }

    /// Compare the store against the target version of `migrations`
    pub fn check_status(&mut self, migrations: &[Migration]) -> Result<SchemaStatus, QueryError> {
        let meta = self.meta_table()?;
        if !self.tables()?.contains(&meta) {
            return Ok(SchemaStatus::NotInitialized);
        }
        if let Some(version) = self.in_progress()? {
            return Ok(SchemaStatus::Interrupted { version });
        }

        let current = self.schema_version()?;
        let target = target_version(migrations);
        if current == target {
            Ok(SchemaStatus::Current)
        } else if current < target {
            Ok(SchemaStatus::NeedsMigration {
                from: current,
                to: target,
            })
        } else {
            Ok(SchemaStatus::Incompatible {
                database_version: current,
                required_version: target,
            })
        }
    }

    /// Create `table` with `columns`, or add whichever columns are missing
    pub fn ensure_table(&mut self, table: &str, columns: &[String]) -> Result<(), QueryError> {
        let physical = self.physical(table)?;
        let columns = columns
            .iter()
            .map(|c| identifier(c))
            .collect::<Result<Vec<_>, _>>()?;

        if !self.tables()?.contains(&physical) {
            debug!("creating table {}", physical);
            let sql = self.dialect.render(&Operation::CreateTable {
                table: &physical,
                columns: &columns,
            })?;
            return self.session.execute_batch(&sql);
        }

        let existing = self.columns(&physical)?;
        for column in columns.iter().filter(|c| !existing.contains(*c)) {
            debug!("adding column {}.{}", physical, column);
            let sql = self.dialect.render(&Operation::AddColumn {
                table: &physical,
                column,
            })?;
            self.session.execute_batch(&sql)?;
        }
        Ok(())
    }

    /// Add `column` to an existing table when absent
    pub fn ensure_column(&mut self, table: &str, column: &str) -> Result<(), QueryError> {
        let physical = self.physical(table)?;
        let column = identifier(column)?;
        if !self.tables()?.contains(&physical) {
            return Err(QueryError::UnknownTable(table.to_string()));
        }
        if self.columns(&physical)?.contains(&column) {
            return Ok(());
        }
        let sql = self.dialect.render(&Operation::AddColumn {
            table: &physical,
            column: &column,
        })?;
        self.session.execute_batch(&sql)
    }

    /// Idempotently ensure every configured table and column exists
    pub fn ensure_declared(
        &mut self,
        declared: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), QueryError> {
        for (table, columns) in declared {
            self.ensure_table(table, columns)?;
        }
        Ok(())
    }

    fn apply(&mut self, change: &SchemaChange) -> Result<(), QueryError> {
        match change {
            SchemaChange::CreateTable { table, columns } => self.ensure_table(table, columns),
            SchemaChange::AddColumn { table, column } => self.ensure_column(table, column),
            SchemaChange::Raw(sql) => self.session.execute_batch(sql),
        }
    }

    fn apply_transactional(&mut self, step: &Migration) -> Result<(), QueryError> {
        let begin = self.dialect.render(&Operation::Begin)?;
        self.session.execute_batch(&begin)?;

        let result = step
            .changes
            .iter()
            .try_for_each(|change| self.apply(change))
            .and_then(|_| self.set_meta(SCHEMA_VERSION_KEY, &step.version.to_string()))
            .and_then(|_| self.delete_meta(IN_PROGRESS_KEY));

        match result {
            Ok(()) => {
                let commit = self.dialect.render(&Operation::Commit)?;
                self.session.execute_batch(&commit)
            }
            Err(e) => {
                let rollback = self.dialect.render(&Operation::Rollback)?;
                if let Err(rb) = self.session.execute_batch(&rollback) {
                    warn!("rollback of schema step v{} failed: {}", step.version, rb);
                }
                Err(e)
            }
        }
    }

    fn apply_marked(&mut self, step: &Migration) -> Result<(), QueryError> {
        self.set_meta(IN_PROGRESS_KEY, &step.version.to_string())?;
        for change in &step.changes {
            self.apply(change)?;
        }
        self.set_meta(SCHEMA_VERSION_KEY, &step.version.to_string())?;
        self.delete_meta(IN_PROGRESS_KEY)
    }

    /// Bring the store up to the highest version in `migrations`
    ///
    /// Re-running against an up-to-date store is a no-op.
    pub fn migrate(&mut self, migrations: &[Migration]) -> Result<MigrationOutcome, MigrationError> {
        let failed = |version: u32| {
            move |e: QueryError| MigrationError::StepFailed {
                version,
                reason: e.to_string(),
            }
        };

        self.ensure_meta_table().map_err(failed(0))?;
        let current = self.schema_version().map_err(failed(0))?;
        let target = target_version(migrations);
        if current > target {
            return Err(MigrationError::NewerStore {
                found: current,
                supported: target,
            });
        }

        if let Some(marked) = self.in_progress().map_err(failed(0))? {
            if marked <= current {
                // version was recorded but the marker survived
                self.delete_meta(IN_PROGRESS_KEY).map_err(failed(marked))?;
            } else {
                match migrations.iter().find(|m| m.version == marked) {
                    Some(step) if step.idempotent => {
                        warn!(
                            "schema step v{} ({}) was interrupted; re-applying",
                            step.version, step.description
                        );
                    }
                    Some(step) => {
                        return Err(MigrationError::NonIdempotentStepFailedMidway {
                            version: step.version,
                            description: step.description.clone(),
                        });
                    }
                    None => {
                        return Err(MigrationError::StepFailed {
                            version: marked,
                            reason: "interrupted step is not among the known migrations"
                                .to_string(),
                        });
                    }
                }
            }
        }

        let mut pending: Vec<&Migration> =
            migrations.iter().filter(|m| m.version > current).collect();
        pending.sort_by_key(|m| m.version);

        let mut applied = vec![];
        for step in pending {
            info!("applying schema step v{}: {}", step.version, step.description);
            let result = if self.dialect.transactional_ddl {
                self.apply_transactional(step)
            } else {
                self.apply_marked(step)
            };
            result.map_err(failed(step.version))?;
            applied.push(step.version);
        }

        Ok(MigrationOutcome {
            from: current,
            to: current.max(target),
            applied,
        })
    }
}
