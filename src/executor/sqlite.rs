//! SQLite Executor
//!
//! Executes raw SQL text against the node's database file. Statements run
//! in order; row output is collected in `sqlite3`-CLI list format. A
//! per-executor sequence number increments once per successful execution
//! and is reported back in each output.

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection};
use tokio::sync::Mutex;

use super::ExecOutput;
use crate::error::{Error, Result};

struct Inner {
    conn: Connection,
    sequence: u64,
}

/// SQLite executor for applying replicated queries.
///
/// The connection is owned by a mutex: the apply step is the only writer,
/// and the consensus log guarantees one apply at a time, so the lock is
/// never contended on the write path.
pub struct SqliteExecutor {
    inner: Mutex<Inner>,
}

impl SqliteExecutor {
    /// Open the executor against a database file.
    ///
    /// Any pre-existing file is removed first: database contents are
    /// rebuilt entirely from committed log replay, so a stale file from a
    /// previous run must not survive a restart.
    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("Failed to open database {:?}: {}", path, e)))?;

        Ok(Self {
            inner: Mutex::new(Inner { conn, sequence: 0 }),
        })
    }

    /// Open an in-memory executor (used by tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("Failed to open in-memory database: {}", e)))?;

        Ok(Self {
            inner: Mutex::new(Inner { conn, sequence: 0 }),
        })
    }

    /// Execute raw SQL text and collect its output.
    ///
    /// Stops at the first failing statement; the returned error carries
    /// the engine's diagnostic text. The sequence number only advances
    /// when the whole text executed successfully.
    pub async fn execute(&self, query: &str) -> Result<ExecOutput> {
        let mut inner = self.inner.lock().await;

        let stdout = run_statements(&inner.conn, query)?;

        inner.sequence += 1;
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            sequence_number: inner.sequence,
        })
    }

    /// Current execution sequence number
    pub async fn sequence_number(&self) -> u64 {
        self.inner.lock().await.sequence
    }
}

fn run_statements(conn: &Connection, query: &str) -> Result<String> {
    let mut stdout = String::new();
    let mut batch = Batch::new(conn, query);

    loop {
        let mut stmt = match batch.next() {
            Ok(Some(stmt)) => stmt,
            Ok(None) => break,
            Err(e) => return Err(exec_failure(e)),
        };

        if stmt.column_count() > 0 {
            let columns = stmt.column_count();
            let mut rows = stmt.query([]).map_err(exec_failure)?;
            while let Some(row) = rows.next().map_err(exec_failure)? {
                let mut fields = Vec::with_capacity(columns);
                for i in 0..columns {
                    fields.push(format_value(row.get_ref(i).map_err(exec_failure)?));
                }
                stdout.push_str(&fields.join("|"));
                stdout.push('\n');
            }
        } else {
            stmt.execute([]).map_err(exec_failure)?;
        }
    }

    Ok(stdout)
}

fn exec_failure(e: rusqlite::Error) -> Error {
    Error::Execution {
        message: e.to_string(),
        stderr: format!("Error: {}", e),
    }
}

/// Format a single column value the way the `sqlite3` shell does in list
/// mode: NULL prints as an empty field.
fn format_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_ddl_and_rows() {
        let executor = SqliteExecutor::open_in_memory().unwrap();

        let out = executor
            .execute("CREATE TABLE t (id INTEGER, name TEXT)")
            .await
            .unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(out.sequence_number, 1);

        executor
            .execute("INSERT INTO t VALUES (1, 'alpha'); INSERT INTO t VALUES (2, 'beta')")
            .await
            .unwrap();

        let out = executor.execute("SELECT * FROM t ORDER BY id").await.unwrap();
        assert_eq!(out.stdout, "1|alpha\n2|beta\n");
        assert_eq!(out.sequence_number, 3);
    }

    #[tokio::test]
    async fn test_null_prints_empty_field() {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        executor.execute("CREATE TABLE t (a, b)").await.unwrap();
        executor.execute("INSERT INTO t VALUES (NULL, 7)").await.unwrap();

        let out = executor.execute("SELECT a, b FROM t").await.unwrap();
        assert_eq!(out.stdout, "|7\n");
    }

    #[tokio::test]
    async fn test_invalid_sql_keeps_sequence() {
        let executor = SqliteExecutor::open_in_memory().unwrap();

        let err = executor.execute("NOT VALID SQL").await.unwrap_err();
        match err {
            Error::Execution { message, stderr } => {
                assert!(message.contains("syntax error"), "message: {}", message);
                assert!(stderr.starts_with("Error: "), "stderr: {}", stderr);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(executor.sequence_number().await, 0);

        // A later valid query still gets sequence number 1.
        let out = executor.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        assert_eq!(out.sequence_number, 1);
    }

    #[tokio::test]
    async fn test_open_removes_stale_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");

        {
            let executor = SqliteExecutor::open(&path).unwrap();
            executor.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        }

        // Reopening discards the previous contents.
        let executor = SqliteExecutor::open(&path).unwrap();
        let err = executor.execute("SELECT * FROM t").await.unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }
}
