//! Table-driven SQL dialects
//!
//! Every statement hoststore issues is described by a backend-agnostic
//! [`Operation`] and rendered through the [`DialectTemplate`] of the selected
//! [`BackendKind`]. Engine differences (identifier quoting, placeholder syntax,
//! column types, upsert flavour, catalogue queries) live in the four template
//! rows below rather than in branches scattered through the query code.
//!
//! Parameter order for rendered statements:
//!
//! | Operation       | Parameters                 | Select list            |
//! |-----------------|----------------------------|------------------------|
//! | `Insert`        | key, values...             |                        |
//! | `Upsert`        | key, values...             |                        |
//! | `Update`        | values..., key             |                        |
//! | `SelectByKey`   | key                        | key, columns...        |
//! | `Scan`          | [like-pattern]             | key, columns...        |
//! | `DeleteByKey`   | key                        |                        |
//! | `ClearColumn`   | key                        |                        |
//! | `ListTables`    |                            | table name             |
//! | `ListColumns`   | table name                 | column name            |
//! | `UpsertMeta`    | key, value, updated_at     |                        |
//! | `SelectMeta`    | key                        | value                  |
//! | `DeleteMeta`    | key                        |                        |

use crate::database::core::backend::{BackendKind, Feature};
use crate::error::QueryError;

/// Primary key column of every application table
pub const KEY_COLUMN: &str = "id";

/// Key column of the reserved meta table
pub const META_KEY_COLUMN: &str = "meta_key";
pub const META_VALUE_COLUMN: &str = "meta_value";
pub const META_UPDATED_COLUMN: &str = "updated_at";

/// Escape character used in `LIKE` prefix filters
const LIKE_ESCAPE: char = '!';

/// Longest identifier accepted on every supported engine
const MAX_IDENTIFIER_LEN: usize = 63;

/// Longest row key, in characters; bounded by the `VARCHAR(255)` key column
pub const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?1, ?2, ...`
    Numbered,
    /// `?, ?, ...`
    Anonymous,
    /// `$1, $2, ...`
    Dollar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStyle {
    /// `ON CONFLICT (key) DO UPDATE SET c = excluded.c`
    OnConflict,
    /// `ON DUPLICATE KEY UPDATE c = VALUES(c)`
    OnDuplicateKey,
}

/// One row of the dialect table
#[derive(Debug)]
pub struct DialectTemplate {
    pub kind: BackendKind,
    pub quote: char,
    pub placeholder: PlaceholderStyle,
    pub key_type: &'static str,
    pub value_type: &'static str,
    pub upsert: UpsertStyle,
    pub add_column_if_not_exists: bool,
    pub transactional_ddl: bool,
    pub native_pooling: bool,
    pub network_config: bool,
    pub begin: &'static str,
    pub list_tables: &'static str,
    pub list_columns: &'static str,
}

pub static DIALECTS: [DialectTemplate; 4] = [
    DialectTemplate {
        kind: BackendKind::EmbeddedFile,
        quote: '"',
        placeholder: PlaceholderStyle::Numbered,
        key_type: "TEXT NOT NULL",
        value_type: "TEXT",
        upsert: UpsertStyle::OnConflict,
        add_column_if_not_exists: false,
        transactional_ddl: true,
        native_pooling: false,
        network_config: false,
        begin: "BEGIN",
        list_tables: "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite!_%' ESCAPE '!' ORDER BY name",
        list_columns: "SELECT name FROM pragma_table_info(?1) ORDER BY cid",
    },
    DialectTemplate {
        kind: BackendKind::EmbeddedMemory,
        quote: '"',
        placeholder: PlaceholderStyle::Anonymous,
        key_type: "VARCHAR",
        value_type: "VARCHAR",
        upsert: UpsertStyle::OnConflict,
        add_column_if_not_exists: true,
        transactional_ddl: true,
        native_pooling: false,
        network_config: false,
        begin: "BEGIN TRANSACTION",
        list_tables: "SELECT table_name FROM information_schema.tables WHERE table_catalog = current_database() AND table_schema = 'main' AND table_type = 'BASE TABLE' ORDER BY table_name",
        list_columns: "SELECT column_name FROM information_schema.columns WHERE table_catalog = current_database() AND table_schema = 'main' AND table_name = ? ORDER BY ordinal_position",
    },
    DialectTemplate {
        kind: BackendKind::NetworkedEngineA,
        quote: '`',
        placeholder: PlaceholderStyle::Anonymous,
        // binary collation keeps keys case-sensitive, like the other engines
        key_type: "VARCHAR(255) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL",
        value_type: "TEXT",
        upsert: UpsertStyle::OnDuplicateKey,
        add_column_if_not_exists: false,
        transactional_ddl: false,
        native_pooling: true,
        network_config: true,
        begin: "START TRANSACTION",
        list_tables: "SELECT CAST(table_name AS CHAR) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' ORDER BY table_name",
        list_columns: "SELECT CAST(column_name AS CHAR) FROM information_schema.columns WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position",
    },
    DialectTemplate {
        kind: BackendKind::NetworkedEngineB,
        quote: '"',
        placeholder: PlaceholderStyle::Dollar,
        key_type: "TEXT NOT NULL",
        value_type: "TEXT",
        upsert: UpsertStyle::OnConflict,
        add_column_if_not_exists: true,
        transactional_ddl: true,
        native_pooling: true,
        network_config: true,
        begin: "BEGIN",
        list_tables: "SELECT table_name::text FROM information_schema.tables WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' ORDER BY table_name",
        list_columns: "SELECT column_name::text FROM information_schema.columns WHERE table_schema = current_schema() AND table_name::text = $1 ORDER BY ordinal_position",
    },
];

/// Backend-agnostic description of a statement
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    CreateTable {
        table: &'a str,
        columns: &'a [String],
    },
    AddColumn {
        table: &'a str,
        column: &'a str,
    },
    ListTables,
    ListColumns,
    Insert {
        table: &'a str,
        columns: &'a [String],
    },
    Upsert {
        table: &'a str,
        columns: &'a [String],
    },
    Update {
        table: &'a str,
        columns: &'a [String],
    },
    SelectByKey {
        table: &'a str,
        columns: &'a [String],
    },
    Scan {
        table: &'a str,
        columns: &'a [String],
        prefix_filter: bool,
        limit: Option<u64>,
    },
    DeleteByKey {
        table: &'a str,
    },
    ClearColumn {
        table: &'a str,
        column: &'a str,
    },
    CreateMetaTable {
        table: &'a str,
    },
    UpsertMeta {
        table: &'a str,
    },
    SelectMeta {
        table: &'a str,
    },
    DeleteMeta {
        table: &'a str,
    },
    Begin,
    Commit,
    Rollback,
}

impl DialectTemplate {
    pub fn for_kind(kind: BackendKind) -> &'static DialectTemplate {
        match kind {
            BackendKind::EmbeddedFile => &DIALECTS[0],
            BackendKind::EmbeddedMemory => &DIALECTS[1],
            BackendKind::NetworkedEngineA => &DIALECTS[2],
            BackendKind::NetworkedEngineB => &DIALECTS[3],
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::UpsertOnConflict => self.upsert == UpsertStyle::OnConflict,
            Feature::UpsertOnDuplicateKey => self.upsert == UpsertStyle::OnDuplicateKey,
            Feature::AddColumnIfNotExists => self.add_column_if_not_exists,
            Feature::TransactionalDdl => self.transactional_ddl,
            Feature::NativePooling => self.native_pooling,
            Feature::NetworkConfig => self.network_config,
        }
    }

    /// Quote an already-validated identifier
    pub fn quote(&self, ident: &str) -> String {
        format!("{q}{ident}{q}", q = self.quote)
    }

    /// Placeholder for the 1-based parameter `index`
    pub fn placeholder(&self, index: usize) -> String {
        match self.placeholder {
            PlaceholderStyle::Numbered => format!("?{}", index),
            PlaceholderStyle::Anonymous => "?".to_string(),
            PlaceholderStyle::Dollar => format!("${}", index),
        }
    }

    fn placeholders(&self, from: usize, count: usize) -> String {
        (from..from + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn column_list(&self, key: &str, columns: &[String]) -> String {
        std::iter::once(key)
            .chain(columns.iter().map(String::as_str))
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn create_table(&self, table: &str, key: &str, columns: &[String]) -> String {
        let mut defs = vec![format!("{} {} PRIMARY KEY", self.quote(key), self.key_type)];
        defs.extend(
            columns
                .iter()
                .map(|c| format!("{} {}", self.quote(c), self.value_type)),
        );
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(table),
            defs.join(", ")
        )
    }

    fn upsert(&self, table: &str, key: &str, columns: &[String]) -> String {
        let insert = format!(
            "INTO {} ({}) VALUES ({})",
            self.quote(table),
            self.column_list(key, columns),
            self.placeholders(1, columns.len() + 1)
        );
        if columns.is_empty() {
            return match self.upsert {
                UpsertStyle::OnConflict => format!(
                    "INSERT {} ON CONFLICT ({}) DO NOTHING",
                    insert,
                    self.quote(key)
                ),
                UpsertStyle::OnDuplicateKey => format!("INSERT IGNORE {}", insert),
            };
        }
        let assignments = columns
            .iter()
            .map(|c| {
                let q = self.quote(c);
                match self.upsert {
                    UpsertStyle::OnConflict => format!("{q} = excluded.{q}"),
                    UpsertStyle::OnDuplicateKey => format!("{q} = VALUES({q})"),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        match self.upsert {
            UpsertStyle::OnConflict => format!(
                "INSERT {} ON CONFLICT ({}) DO UPDATE SET {}",
                insert,
                self.quote(key),
                assignments
            ),
            UpsertStyle::OnDuplicateKey => {
                format!("INSERT {} ON DUPLICATE KEY UPDATE {}", insert, assignments)
            }
        }
    }

    /// Render `op` into a statement for this engine
    pub fn render(&self, op: &Operation<'_>) -> Result<String, QueryError> {
        let sql = match *op {
            Operation::CreateTable { table, columns } => {
                self.create_table(table, KEY_COLUMN, columns)
            }
            Operation::AddColumn { table, column } => {
                let if_not_exists = if self.add_column_if_not_exists {
                    "IF NOT EXISTS "
                } else {
                    ""
                };
                format!(
                    "ALTER TABLE {} ADD COLUMN {}{} {}",
                    self.quote(table),
                    if_not_exists,
                    self.quote(column),
                    self.value_type
                )
            }
            Operation::ListTables => self.list_tables.to_string(),
            Operation::ListColumns => self.list_columns.to_string(),
            Operation::Insert { table, columns } => format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quote(table),
                self.column_list(KEY_COLUMN, columns),
                self.placeholders(1, columns.len() + 1)
            ),
            Operation::Upsert { table, columns } => self.upsert(table, KEY_COLUMN, columns),
            Operation::Update { table, columns } => {
                if columns.is_empty() {
                    return Err(QueryError::Database(format!(
                        "update of '{}' names no columns",
                        table
                    )));
                }
                let assignments = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = {}", self.quote(c), self.placeholder(i + 1)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "UPDATE {} SET {} WHERE {} = {}",
                    self.quote(table),
                    assignments,
                    self.quote(KEY_COLUMN),
                    self.placeholder(columns.len() + 1)
                )
            }
            Operation::SelectByKey { table, columns } => format!(
                "SELECT {} FROM {} WHERE {} = {}",
                self.column_list(KEY_COLUMN, columns),
                self.quote(table),
                self.quote(KEY_COLUMN),
                self.placeholder(1)
            ),
            Operation::Scan {
                table,
                columns,
                prefix_filter,
                limit,
            } => {
                let mut sql = format!(
                    "SELECT {} FROM {}",
                    self.column_list(KEY_COLUMN, columns),
                    self.quote(table)
                );
                if prefix_filter {
                    sql.push_str(&format!(
                        " WHERE {} LIKE {} ESCAPE '{}'",
                        self.quote(KEY_COLUMN),
                        self.placeholder(1),
                        LIKE_ESCAPE
                    ));
                }
                sql.push_str(&format!(" ORDER BY {}", self.quote(KEY_COLUMN)));
                if let Some(limit) = limit {
                    sql.push_str(&format!(" LIMIT {}", limit));
                }
                sql
            }
            Operation::DeleteByKey { table } => format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote(table),
                self.quote(KEY_COLUMN),
                self.placeholder(1)
            ),
            Operation::ClearColumn { table, column } => format!(
                "UPDATE {} SET {} = NULL WHERE {} = {}",
                self.quote(table),
                self.quote(column),
                self.quote(KEY_COLUMN),
                self.placeholder(1)
            ),
            Operation::CreateMetaTable { table } => self.create_table(
                table,
                META_KEY_COLUMN,
                &[
                    META_VALUE_COLUMN.to_string(),
                    META_UPDATED_COLUMN.to_string(),
                ],
            ),
            Operation::UpsertMeta { table } => self.upsert(
                table,
                META_KEY_COLUMN,
                &[
                    META_VALUE_COLUMN.to_string(),
                    META_UPDATED_COLUMN.to_string(),
                ],
            ),
            Operation::SelectMeta { table } => format!(
                "SELECT {} FROM {} WHERE {} = {}",
                self.quote(META_VALUE_COLUMN),
                self.quote(table),
                self.quote(META_KEY_COLUMN),
                self.placeholder(1)
            ),
            Operation::DeleteMeta { table } => format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote(table),
                self.quote(META_KEY_COLUMN),
                self.placeholder(1)
            ),
            Operation::Begin => self.begin.to_string(),
            Operation::Commit => "COMMIT".to_string(),
            Operation::Rollback => "ROLLBACK".to_string(),
        };
        Ok(sql)
    }
}

/// Validate and normalise a table or column name
///
/// Names are lower-cased; the result contains only `[a-z0-9_]` and does not
/// start with a digit.
pub fn identifier(name: &str) -> Result<String, QueryError> {
    let lowered = name.trim().to_lowercase();
    let valid = !lowered.is_empty()
        && lowered.len() <= MAX_IDENTIFIER_LEN
        && !lowered.starts_with(|c: char| c.is_ascii_digit())
        && lowered
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(lowered)
    } else {
        Err(QueryError::InvalidIdentifier(name.to_string()))
    }
}

/// `LIKE` pattern matching every key that starts with `prefix`
pub fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if c == LIKE_ESCAPE || c == '%' || c == '_' {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
