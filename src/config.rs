//! QuorumDB Configuration
//!
//! This module provides configuration structures for a QuorumDB
//! cluster node.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main QuorumDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumDbConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for the database file and the replicated log.
    /// The node's name is derived from the final path component.
    pub data_dir: PathBuf,

    /// Address to bind the HTTP listener (client and cluster traffic)
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address of an existing member to join at startup.
    /// When unset the node bootstraps a new single-member cluster.
    #[serde(default)]
    pub join_address: Option<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file name inside the data directory.
    /// Removed at startup; contents are rebuilt from log replay.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Replicated log store file name inside the data directory
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_election_timeout_min_ms() -> u64 {
    1500
}

fn default_election_timeout_max_ms() -> u64 {
    3000
}

fn default_database_file() -> String {
    "storage.db".to_string()
}

fn default_log_file() -> String {
    "log.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            join_address: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl QuorumDbConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: QuorumDbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.data_dir cannot be empty".into()));
        }

        if node_name(&self.node.data_dir).is_none() {
            return Err(crate::Error::Config(format!(
                "node.data_dir {:?} has no final path component to derive the node name from",
                self.node.data_dir
            )));
        }

        if self.cluster.election_timeout_min_ms > self.cluster.election_timeout_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_timeout_min_ms cannot exceed election_timeout_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// The node's stable name, derived once from the data directory
    pub fn node_name(&self) -> String {
        node_name(&self.node.data_dir).expect("validated at load time")
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Externally reachable connection string for this node
    pub fn connection_string(&self) -> String {
        format!("http://{}", self.advertise_address())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the SQL database file
    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.storage.database_file)
    }

    /// Path of the replicated log store
    pub fn log_store_path(&self) -> PathBuf {
        self.node.data_dir.join(&self.storage.log_file)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }
}

/// Derive a node name from a storage path.
///
/// The name is the final path component, taken once at startup and stable
/// for the node's lifetime. Two nodes must never share a data directory
/// name within one cluster.
pub fn node_name(data_dir: &Path) -> Option<String> {
    data_dir
        .file_name()
        .map(|segment| segment.to_string_lossy().into_owned())
}
