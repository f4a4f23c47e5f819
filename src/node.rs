//! Cluster Node
//!
//! Wires the command layer together: the query machine over the local
//! database, the consensus log, and the client-facing write path with its
//! cached fast path. Also carries the join-protocol client side.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::command::{LogCommand, QueryMachine};
use crate::consensus::{ConsensusLog, Member};
use crate::error::{Error, Result};

/// One process participating in the cluster
pub struct Node {
    name: String,
    connection_string: String,
    machine: Arc<QueryMachine>,
    consensus: Arc<dyn ConsensusLog>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Node {
    /// Create a node over its machine and consensus log
    pub fn new(
        name: String,
        connection_string: String,
        machine: Arc<QueryMachine>,
        consensus: Arc<dyn ConsensusLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            connection_string,
            machine,
            consensus,
            started_at: chrono::Utc::now(),
        })
    }

    /// The node's stable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection string other nodes and clients reach this node at
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// This node as a membership descriptor
    pub fn member(&self) -> Member {
        Member {
            name: self.name.clone(),
            connection_string: self.connection_string.clone(),
        }
    }

    /// The node's query machine
    pub fn machine(&self) -> &Arc<QueryMachine> {
        &self.machine
    }

    /// The node's consensus log
    pub fn consensus(&self) -> &Arc<dyn ConsensusLog> {
        &self.consensus
    }

    /// When this process started
    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    /// Leader-side write path: serve identical repeated requests from the
    /// cache, otherwise replicate the query and block until it is applied.
    pub async fn execute_query(&self, query: Bytes) -> Result<Bytes> {
        if let Some(cached) = self.machine.cache().get(&query).await {
            tracing::debug!("returning cached response");
            return Ok(cached);
        }

        self.consensus
            .submit(LogCommand::query(query.to_vec()))
            .await
    }

    /// Establish this node as the sole member of a new cluster by
    /// replicating a membership entry naming itself through its own,
    /// freshly started consensus log.
    pub async fn bootstrap(&self) -> Result<()> {
        tracing::info!("initializing new cluster as {}", self.name);
        self.consensus.add_member(self.member()).await
    }

    /// Announce this node to an existing member, which replicates the
    /// membership change through the cluster's log. Not retried on
    /// failure.
    pub async fn join_cluster(&self, target: &str) -> Result<()> {
        let target = normalize_address(target);
        tracing::info!("joining cluster via {}", target);

        let body = serde_json::to_vec(&self.member())
            .map_err(|e| Error::Join(format!("failed to encode join request: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Join(e.to_string()))?;

        let response = client
            .post(format!("{}/join", target))
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Join(format!("unable to reach {}: {}", target, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Join(format!(
                "{} rejected the join request ({}): {}",
                target, status, detail
            )));
        }

        Ok(())
    }
}

/// Accept join targets with or without a scheme
fn normalize_address(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    }
}
