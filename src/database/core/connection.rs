//! Session abstraction
//!
//! A [`Session`] is one live driver connection. Every backend adapter produces
//! boxed sessions; the pool and the storage manager only ever talk to this
//! trait, so nothing above this layer knows which driver is in use.
//!
//! Values cross the trait as optional text. Tables managed by hoststore only
//! hold text columns, which keeps parameter binding and row decoding uniform
//! across engines.

use crate::database::core::backend::BackendKind;
use crate::error::QueryError;

/// One bound statement parameter (`None` binds SQL `NULL`)
pub type Param = Option<String>;

/// One result row, in select-list order
pub type Row = Vec<Option<String>>;

/// A live connection to a store
pub trait Session: Send {
    fn backend(&self) -> BackendKind;

    /// Execute one statement, returning the number of affected rows
    fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64, QueryError>;

    /// Run a query whose select list has exactly `columns` entries
    fn query(&mut self, sql: &str, params: &[Param], columns: usize)
        -> Result<Vec<Row>, QueryError>;

    /// Execute a parameterless statement (DDL, transaction control)
    fn execute_batch(&mut self, sql: &str) -> Result<(), QueryError>;

    /// Cheap liveness check
    fn ping(&mut self) -> bool {
        self.query("SELECT 1", &[], 1).is_ok()
    }

    /// Release the underlying driver connection
    fn close(self: Box<Self>);
}

/// Convenience helpers shared by every session
pub trait SessionExt {
    /// First column of the first row, if any
    fn query_scalar(&mut self, sql: &str, params: &[Param]) -> Result<Option<String>, QueryError>;

    /// First column of every row
    fn query_column(&mut self, sql: &str, params: &[Param]) -> Result<Vec<String>, QueryError>;
}

impl<S: Session + ?Sized> SessionExt for S {
    fn query_scalar(&mut self, sql: &str, params: &[Param]) -> Result<Option<String>, QueryError> {
        let rows = self.query(sql, params, 1)?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten())
    }

    fn query_column(&mut self, sql: &str, params: &[Param]) -> Result<Vec<String>, QueryError> {
        let rows = self.query(sql, params, 1)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }
}

/// Shorthand for building parameter lists from string slices
pub fn params(values: &[&str]) -> Vec<Param> {
    values.iter().map(|v| Some(v.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Session stub that returns canned rows
    struct Canned {
        rows: Vec<Row>,
    }

    impl Session for Canned {
        fn backend(&self) -> BackendKind {
            BackendKind::EmbeddedFile
        }

        fn execute(&mut self, _sql: &str, _params: &[Param]) -> Result<u64, QueryError> {
            Ok(0)
        }

        fn query(
            &mut self,
            _sql: &str,
            _params: &[Param],
            _columns: usize,
        ) -> Result<Vec<Row>, QueryError> {
            Ok(self.rows.clone())
        }

        fn execute_batch(&mut self, _sql: &str) -> Result<(), QueryError> {
            Ok(())
        }

        fn close(self: Box<Self>) {}
    }

    #[test]
    fn test_query_scalar() {
        let mut session = Canned {
            rows: vec![vec![Some("3".to_string())], vec![Some("4".to_string())]],
        };
        assert_eq!(
            session.query_scalar("SELECT v", &[]).unwrap(),
            Some("3".to_string())
        );

        let mut empty = Canned { rows: vec![] };
        assert_eq!(empty.query_scalar("SELECT v", &[]).unwrap(), None);
    }

    #[test]
    fn test_query_column_skips_nulls() {
        let mut session = Canned {
            rows: vec![
                vec![Some("a".to_string())],
                vec![None],
                vec![Some("b".to_string())],
            ],
        };
        assert_eq!(
            session.query_column("SELECT v", &[]).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_params_helper() {
        assert_eq!(
            params(&["x", "y"]),
            vec![Some("x".to_string()), Some("y".to_string())]
        );
    }
}
