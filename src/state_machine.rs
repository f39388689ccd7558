//! Applying committed queries to the local database.

use crate::errors::StoreError;
use crate::sql::{Sql, SqlError};

/// Deterministic target of committed queries.
///
/// Implementations must produce the same result on every replica when the
/// same queries are applied in the same order.
pub trait StateMachine: Send {
    /// Applies a committed query and returns the reply for its submitter.
    ///
    /// A failed statement is still considered applied; its error is part of
    /// the deterministic result.
    fn apply(&mut self, query: &str) -> Result<Vec<u8>, StoreError>;
}

/// State machine backed by the node's SQLite database.
#[derive(Debug)]
pub struct SqlStateMachine {
    sql: Sql,
}

impl SqlStateMachine {
    /// Creates a state machine over `sql`.
    pub fn new(sql: Sql) -> Self {
        Self { sql }
    }
}

impl StateMachine for SqlStateMachine {
    fn apply(&mut self, query: &str) -> Result<Vec<u8>, StoreError> {
        match self.sql.execute(query) {
            Ok(output) => Ok(format!(
                "SequenceNumber: {}\n{}",
                output.sequence_number, output.stdout
            )
            .into_bytes()),
            Err(e) => Err(StoreError::Execution(describe_failure(query, &e))),
        }
    }
}

fn describe_failure(query: &str, err: &SqlError) -> String {
    if err.output.stderr.is_empty() {
        return err.to_string();
    }
    format!(
        "Error executing {:?} ({})\n\nSQLite error: {}",
        query,
        err,
        err.output.stderr.trim_end()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_machine() -> (tempfile::TempDir, SqlStateMachine) {
        let dir = tempfile::tempdir().unwrap();
        let sql = Sql::open(dir.path().join("storage.sql")).unwrap();
        (dir, SqlStateMachine::new(sql))
    }

    #[test]
    fn replies_with_sequence_number_and_rows() {
        let (_dir, mut sm) = state_machine();
        assert_eq!(sm.apply("CREATE TABLE t (x)").unwrap(), b"SequenceNumber: 1\n");
        sm.apply("INSERT INTO t VALUES (42)").unwrap();
        assert_eq!(
            sm.apply("SELECT x FROM t").unwrap(),
            b"SequenceNumber: 3\n42\n"
        );
    }

    #[test]
    fn failed_statement_reports_query_and_engine_error() {
        let (_dir, mut sm) = state_machine();
        let err = sm.apply("INSERT INTO nope VALUES (1)").unwrap_err();
        let message = match err {
            StoreError::Execution(message) => message,
            other => panic!("unexpected error: {:?}", other),
        };
        assert!(message.starts_with("Error executing \"INSERT INTO nope VALUES (1)\""));
        assert!(message.contains("SQLite error: Error: no such table: nope"));
        // The failure still consumed a sequence number.
        assert_eq!(sm.apply("SELECT 1").unwrap(), b"SequenceNumber: 2\n1\n");
    }
}
