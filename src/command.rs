//! Command Layer
//!
//! Turns inbound write requests into replicable commands and applies
//! committed commands exactly once per node: execute against the local
//! relational engine, format the response, advance the apply counter, and
//! cache the result under the exact query bytes so retried requests skip
//! replication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::consensus::{Member, NodeRole, StateMachine};
use crate::error::{Error, Result};
use crate::executor::{ExecOutput, SqliteExecutor};

/// A replicated command.
///
/// The serialized variant name is the stable command name that routes a
/// log entry back to the right apply logic on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogCommand {
    /// Execute raw query bytes against the local database.
    /// The bytes are carried exactly as received: cache lookups and
    /// replication both key off the unmodified byte sequence.
    Query { query: Vec<u8> },

    /// Admit a member to the cluster.
    AddMember { member: Member },

    /// Leader barrier entry, appended on election so entries from earlier
    /// terms become committable.
    Nop,
}

impl LogCommand {
    /// Wrap raw query bytes, unmodified
    pub fn query(query: impl Into<Vec<u8>>) -> Self {
        LogCommand::Query { query: query.into() }
    }

    /// Stable name of this command's kind
    pub fn name(&self) -> &'static str {
        match self {
            LogCommand::Query { .. } => "query",
            LogCommand::AddMember { .. } => "add-member",
            LogCommand::Nop => "nop",
        }
    }
}

/// Response cache: exact raw query bytes -> previously computed response.
///
/// Written only by the apply step, which the consensus log runs one entry
/// at a time; read concurrently by every request handler, hence the lock.
/// Entries are never evicted — one entry per distinct query text for the
/// process lifetime.
#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<Vec<u8>, Bytes>>,
}

impl ResponseCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cached response for these exact query bytes
    pub async fn get(&self, query: &[u8]) -> Option<Bytes> {
        self.entries.read().await.get(query).cloned()
    }

    /// Store a response under its exact query bytes
    pub async fn insert(&self, query: Vec<u8>, response: Bytes) {
        self.entries.write().await.insert(query, response);
    }

    /// Number of cached responses
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Format a successful execution as the client-visible response
pub fn format_response(output: &ExecOutput) -> Bytes {
    Bytes::from(format!(
        "SequenceNumber: {}\n{}",
        output.sequence_number, output.stdout
    ))
}

/// The node's state machine: applies committed query commands to the
/// local database.
pub struct QueryMachine {
    executor: SqliteExecutor,
    cache: ResponseCache,
    applied: AtomicU64,
}

impl QueryMachine {
    /// Create a machine over the node's executor
    pub fn new(executor: SqliteExecutor) -> Self {
        Self {
            executor,
            cache: ResponseCache::new(),
            applied: AtomicU64::new(0),
        }
    }

    /// The response cache, for the request-side fast path
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Number of commands applied on this node
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Current execution sequence number
    pub async fn sequence_number(&self) -> u64 {
        self.executor.sequence_number().await
    }
}

#[async_trait]
impl StateMachine for QueryMachine {
    async fn apply_query(&self, query: &[u8], role: NodeRole) -> Result<Bytes> {
        let text = String::from_utf8_lossy(query);
        tracing::debug!(role = %role, "applying query");

        let output = match self.executor.execute(&text).await {
            Ok(output) => output,
            Err(e) => return Err(compose_failure(query, e)),
        };

        let formatted = format_response(&output);
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.cache.insert(query.to_vec(), formatted.clone()).await;

        Ok(formatted)
    }
}

/// Build the caller-visible execution failure: when the engine produced
/// diagnostic output, the message carries the original query, the engine
/// error, and the diagnostic text together.
fn compose_failure(query: &[u8], e: Error) -> Error {
    match e {
        Error::Execution { message, stderr } if !stderr.is_empty() => {
            let composite = format!(
                "Error executing {:?} ({})\n\nSQLite error: {}",
                String::from_utf8_lossy(query),
                message,
                stderr.trim()
            );
            Error::Execution {
                message: composite,
                stderr,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> QueryMachine {
        QueryMachine::new(SqliteExecutor::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_apply_formats_and_caches() {
        let machine = machine();

        let response = machine
            .apply_query(b"CREATE TABLE t (id INTEGER)", NodeRole::Leader)
            .await
            .unwrap();
        assert_eq!(&response[..], b"SequenceNumber: 1\n");
        assert_eq!(machine.applied_count(), 1);

        let cached = machine.cache().get(b"CREATE TABLE t (id INTEGER)").await;
        assert_eq!(cached.as_deref(), Some(&response[..]));
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_no_trace() {
        let machine = machine();

        let err = machine
            .apply_query(b"NOT VALID SQL", NodeRole::Leader)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("NOT VALID SQL"), "message: {}", message);
        assert!(message.contains("SQLite error:"), "message: {}", message);

        assert_eq!(machine.applied_count(), 0);
        assert!(machine.cache().is_empty().await);
        assert_eq!(machine.sequence_number().await, 0);
    }

    #[tokio::test]
    async fn test_cache_keys_are_exact_bytes() {
        let machine = machine();
        machine
            .apply_query(b"CREATE TABLE t (id INTEGER)", NodeRole::Leader)
            .await
            .unwrap();

        // Leading whitespace is a different key; no normalization happens.
        assert!(machine.cache().get(b" CREATE TABLE t (id INTEGER)").await.is_none());
    }

    #[tokio::test]
    async fn test_identical_sequence_is_deterministic() {
        let a = machine();
        let b = machine();

        let commands: [&[u8]; 3] = [
            b"CREATE TABLE t (id INTEGER)",
            b"INSERT INTO t VALUES (1)",
            b"SELECT * FROM t",
        ];

        for command in commands {
            let ra = a.apply_query(command, NodeRole::Leader).await.unwrap();
            let rb = b.apply_query(command, NodeRole::Follower).await.unwrap();
            assert_eq!(ra, rb);
            assert_eq!(a.applied_count(), b.applied_count());
        }

        assert_eq!(a.cache().len().await, b.cache().len().await);
    }

    #[test]
    fn test_command_names() {
        assert_eq!(LogCommand::query(b"SELECT 1".to_vec()).name(), "query");
        assert_eq!(
            LogCommand::AddMember {
                member: Member {
                    name: "n1".into(),
                    connection_string: "http://localhost:4001".into(),
                },
            }
            .name(),
            "add-member"
        );
        assert_eq!(LogCommand::Nop.name(), "nop");
    }
}
