//! SQLite execution engine.
//!
//! Every node owns one database file that is only ever written by applying
//! committed log entries, so the file is recreated empty at startup and
//! rebuilt from the log.

use derivative::Derivative;
use sqlite::{Connection, OpenFlags};
use std::io;
use std::path::Path;
use thiserror::Error;

/// Output of a single execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Position of this execution in the apply order, starting at 1.
    pub sequence_number: u64,
    /// Result rows, one per line with columns separated by `|`.
    pub stdout: String,
    /// Engine diagnostics.
    pub stderr: String,
}

/// A statement that the engine rejected.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct SqlError {
    /// Output produced before the failure, including diagnostics.
    pub output: Output,
    /// The engine error.
    pub source: sqlite::Error,
}

/// SQL database of a node.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Sql {
    #[derivative(Debug = "ignore")]
    conn: Connection,
    sequence_number: u64,
}

impl Sql {
    /// Creates a fresh database at `path`, removing any previous file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, crate::StoreError> {
        let path = path.as_ref();
        ensure_absent(path)?;
        ensure_absent(&path.with_extension("sql-journal"))?;
        let flags = OpenFlags::new()
            .set_read_write()
            .set_create()
            .set_no_mutex();
        let mut conn = Connection::open_with_flags(path, flags)?;
        conn.set_busy_timeout(5000)?;
        Ok(Sql {
            conn,
            sequence_number: 0,
        })
    }

    /// Sequence number of the last execution.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Executes `query`, which may contain several statements.
    ///
    /// Every call consumes a sequence number, whether or not the statement
    /// succeeds.
    pub fn execute(&mut self, query: &str) -> Result<Output, SqlError> {
        self.sequence_number += 1;
        let mut stdout = String::new();
        let result = self.conn.iterate(query, |pairs| {
            let row: Vec<&str> = pairs
                .iter()
                .map(|&(_, value)| value.unwrap_or(""))
                .collect();
            stdout.push_str(&row.join("|"));
            stdout.push('\n');
            true
        });
        let mut output = Output {
            sequence_number: self.sequence_number,
            stdout,
            stderr: String::new(),
        };
        match result {
            Ok(()) => Ok(output),
            Err(source) => {
                output.stderr = match &source.message {
                    Some(message) => format!("Error: {}\n", message),
                    None => format!("Error: {}\n", source),
                };
                Err(SqlError { output, source })
            }
        }
    }
}

fn ensure_absent(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, Sql) {
        let dir = tempfile::tempdir().unwrap();
        let sql = Sql::open(dir.path().join("storage.sql")).unwrap();
        (dir, sql)
    }

    #[test]
    fn renders_rows_pipe_separated() {
        let (_dir, mut sql) = open();
        sql.execute("CREATE TABLE t (x, y)").unwrap();
        sql.execute("INSERT INTO t VALUES (1, 'one'), (2, NULL)")
            .unwrap();
        let output = sql.execute("SELECT x, y FROM t ORDER BY x").unwrap();
        assert_eq!(output.stdout, "1|one\n2|\n");
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn every_execution_takes_the_next_sequence_number() {
        let (_dir, mut sql) = open();
        assert_eq!(sql.execute("CREATE TABLE t (x)").unwrap().sequence_number, 1);
        let failed = sql.execute("INSERT INTO missing VALUES (1)").unwrap_err();
        assert_eq!(failed.output.sequence_number, 2);
        assert_eq!(sql.execute("SELECT 1").unwrap().sequence_number, 3);
        assert_eq!(sql.sequence_number(), 3);
    }

    #[test]
    fn failures_carry_diagnostics() {
        let (_dir, mut sql) = open();
        let err = sql.execute("SELEC 1").unwrap_err();
        assert!(err.output.stderr.starts_with("Error: "));
        assert!(err.output.stderr.contains("syntax error"));
    }

    #[test]
    fn open_discards_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.sql");
        {
            let mut sql = Sql::open(&path).unwrap();
            sql.execute("CREATE TABLE t (x)").unwrap();
        }
        let mut sql = Sql::open(&path).unwrap();
        assert!(sql.execute("SELECT * FROM t").is_err());
    }
}
