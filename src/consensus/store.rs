//! Log Store
//!
//! Persistent storage for the consensus engine: current term, voted-for,
//! and the replicated log itself. This is the only state that survives a
//! restart; the SQL database is rebuilt from committed entries.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::command::LogCommand;
use crate::consensus::{LogEntry, Member};
use crate::error::{Error, Result};

/// Persistent term/vote metadata and log entries, backed by SQLite
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    /// Create or open the log store
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS raft_meta (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT
            );

            CREATE TABLE IF NOT EXISTS raft_log (
                idx INTEGER PRIMARY KEY,
                term INTEGER NOT NULL,
                payload BLOB NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (used by tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS raft_meta (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT
            );

            CREATE TABLE IF NOT EXISTS raft_log (
                idx INTEGER PRIMARY KEY,
                term INTEGER NOT NULL,
                payload BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the current term (0 when never set)
    pub async fn current_term(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let term: Option<i64> = conn
            .query_row(
                "SELECT value_int FROM raft_meta WHERE key = 'current_term'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(term.unwrap_or(0) as u64)
    }

    /// Set the current term
    pub async fn set_current_term(&self, term: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO raft_meta (key, value_int) VALUES ('current_term', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1
            "#,
            params![term as i64],
        )?;
        Ok(())
    }

    /// Get the voted-for node name in the current term
    pub async fn voted_for(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let voted: Option<String> = conn
            .query_row(
                "SELECT value_text FROM raft_meta WHERE key = 'voted_for'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(voted)
    }

    /// Set or clear the voted-for node name
    pub async fn set_voted_for(&self, name: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        match name {
            Some(name) => {
                conn.execute(
                    r#"
                    INSERT INTO raft_meta (key, value_text) VALUES ('voted_for', ?1)
                    ON CONFLICT(key) DO UPDATE SET value_text = ?1
                    "#,
                    params![name],
                )?;
            }
            None => {
                conn.execute("DELETE FROM raft_meta WHERE key = 'voted_for'", [])?;
            }
        }
        Ok(())
    }

    /// Index of the last log entry (0 when the log is empty)
    pub async fn last_index(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let idx: Option<i64> =
            conn.query_row("SELECT MAX(idx) FROM raft_log", [], |row| row.get(0))?;
        Ok(idx.unwrap_or(0) as u64)
    }

    /// Index and term of the last log entry ((0, 0) when empty)
    pub async fn last_index_term(&self) -> Result<(u64, u64)> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT idx, term FROM raft_log ORDER BY idx DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(i, t)| (i as u64, t as u64)).unwrap_or((0, 0)))
    }

    /// Term of the entry at `index`; `Some(0)` for index 0, `None` when the
    /// entry does not exist
    pub async fn term_of(&self, index: u64) -> Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        let conn = self.conn.lock().await;
        let term: Option<i64> = conn
            .query_row(
                "SELECT term FROM raft_log WHERE idx = ?1",
                params![index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(term.map(|t| t as u64))
    }

    /// Append entries to the log
    pub async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for entry in entries {
            let payload = bincode::serialize(&entry.command)?;
            tx.execute(
                "INSERT OR REPLACE INTO raft_log (idx, term, payload) VALUES (?1, ?2, ?3)",
                params![entry.index as i64, entry.term as i64, payload],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove the entry at `index` and everything after it
    pub async fn truncate_from(&self, index: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM raft_log WHERE idx >= ?1", params![index as i64])?;
        Ok(())
    }

    /// Read the entry at `index`
    pub async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT term, payload FROM raft_log WHERE idx = ?1",
                params![index as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((term, payload)) => Ok(Some(LogEntry {
                index,
                term: term as u64,
                command: bincode::deserialize(&payload)?,
            })),
            None => Ok(None),
        }
    }

    /// Read up to `limit` entries starting at `from`
    pub async fn entries_from(&self, from: u64, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT idx, term, payload FROM raft_log WHERE idx >= ?1 ORDER BY idx LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![from as i64, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (idx, term, payload) = row?;
            entries.push(LogEntry {
                index: idx as u64,
                term: term as u64,
                command: bincode::deserialize(&payload)?,
            });
        }
        Ok(entries)
    }

    /// Scan the whole log for membership entries, in log order.
    ///
    /// Used at startup to rebuild the peer set before any entry has been
    /// re-applied; without it a restarted node would not know it is a
    /// member and could never stand for election.
    pub async fn scan_members(&self) -> Result<Vec<Member>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT payload FROM raft_log ORDER BY idx")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut members: Vec<Member> = Vec::new();
        for row in rows {
            let payload = row?;
            if let LogCommand::AddMember { member } = bincode::deserialize(&payload)? {
                if !members.iter().any(|m| m.name == member.name) {
                    members.push(member);
                }
            }
        }
        Ok(members)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}
