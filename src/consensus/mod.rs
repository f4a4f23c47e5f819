//! Consensus Log Adapter
//!
//! The command layer talks to consensus through the [`ConsensusLog`]
//! boundary: cluster role, leader lookup, membership, and blocking
//! submission of commands for replication. [`RaftLog`] is the bundled
//! engine; any conforming implementation can stand in behind the trait,
//! which is how tests commit commands deterministically without
//! networking.

pub mod raft;
pub mod store;
pub mod transport;

pub use raft::{RaftConfig, RaftLog};
pub use store::LogStore;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::command::LogCommand;
use crate::error::Result;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Node is the cluster leader
    Leader,
    /// Node is a follower
    Follower,
    /// Node is a candidate (during election)
    Candidate,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Follower => write!(f, "FOLLOWER"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// Membership descriptor: a node's stable name and the connection string
/// other nodes reach it at. This is the payload of `/join` requests and of
/// `add-member` log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable node name, unique cluster-wide
    pub name: String,
    /// Externally reachable connection string, e.g. `http://10.0.0.1:4001`
    pub connection_string: String,
}

/// One entry of the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1
    pub index: u64,
    /// Term the entry was created under
    pub term: u64,
    /// The replicated command
    pub command: LogCommand,
}

/// Apply-side boundary: the engine hands every committed `query` command to
/// the machine, in log order, never concurrently.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply one committed query. Failures propagate to the submitting
    /// caller; they must not prevent later entries from applying.
    async fn apply_query(&self, query: &[u8], role: NodeRole) -> Result<Bytes>;
}

/// Capability boundary of the consensus engine.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Start the engine's background work (election timers, heartbeats).
    async fn start(self: std::sync::Arc<Self>) -> Result<()>;

    /// This node's current role.
    async fn role(&self) -> NodeRole;

    /// Connection string of the current leader, if one is known.
    async fn leader_address(&self) -> Option<String>;

    /// All cluster members currently known to this node, including itself.
    async fn peers(&self) -> Vec<Member>;

    /// Submit a command for replication. Blocks until the command is
    /// committed by a majority and applied locally, then returns the apply
    /// result; submission failures (not leader, lost leadership) are
    /// reported without anything having been applied.
    async fn submit(&self, command: LogCommand) -> Result<Bytes>;

    /// Admit a member by replicating an `add-member` entry.
    async fn add_member(&self, member: Member) -> Result<()>;
}
