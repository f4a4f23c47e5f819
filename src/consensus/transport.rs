//! Consensus Transport
//!
//! Wire messages exchanged between engines, carried as JSON POSTs on each
//! node's own HTTP listener under a fixed internal path. These routes are
//! cluster-internal; ordinary clients never call them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::{LogEntry, Member};
use crate::error::{Error, Result};

/// Internal route for append-entries (replication and heartbeats)
pub const APPEND_ENTRIES_PATH: &str = "/internal/raft/append-entries";
/// Internal route for vote requests
pub const REQUEST_VOTE_PATH: &str = "/internal/raft/request-vote";

/// Replication request from the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: u64,
    /// The leader itself; followers learn the leader's connection string
    /// from this field
    pub leader: Member,
    /// Index of the entry immediately before `entries`
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`
    pub prev_log_term: u64,
    /// Entries to append; empty for a pure heartbeat
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: u64,
}

/// Follower's answer to an append-entries request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Responder's term, for leader step-down
    pub term: u64,
    /// Whether the log consistency check passed and entries were stored
    pub success: bool,
    /// Highest log index known to match the leader when `success`
    pub match_index: u64,
}

/// Vote request from a candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: u64,
    /// The candidate itself
    pub candidate: Member,
    /// Index of the candidate's last log entry
    pub last_log_index: u64,
    /// Term of the candidate's last log entry
    pub last_log_term: u64,
}

/// Answer to a vote request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's term
    pub term: u64,
    /// Whether the vote was granted
    pub vote_granted: bool,
}

/// HTTP client for engine-to-engine traffic
pub struct RaftClient {
    http: reqwest::Client,
}

impl RaftClient {
    /// Create a client with explicit connect and request timeouts
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { http }
    }

    /// Send an append-entries request to a peer
    pub async fn append_entries(
        &self,
        connection_string: &str,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post_json(connection_string, APPEND_ENTRIES_PATH, request)
            .await
    }

    /// Send a vote request to a peer
    pub async fn request_vote(
        &self,
        connection_string: &str,
        request: &VoteRequest,
    ) -> Result<VoteResponse> {
        self.post_json(connection_string, REQUEST_VOTE_PATH, request)
            .await
    }

    async fn post_json<Req, Resp>(
        &self,
        connection_string: &str,
        path: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", connection_string, path);

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: connection_string.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        response.json().await.map_err(|e| Error::Network(format!(
            "invalid response from {}: {}",
            url, e
        )))
    }
}

impl Default for RaftClient {
    // Connect fast and give up fast: a replication round is paced by its
    // slowest peer, and rounds must stay well inside the election window.
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_secs(3))
    }
}
