//! QuorumDB Error Types

use thiserror::Error;

/// Result type alias for QuorumDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// QuorumDB error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Execution errors
    #[error("Query execution failed: {message}")]
    Execution {
        /// Error reported by the relational engine
        message: String,
        /// Diagnostic output, one `Error: ...` line per failed statement
        stderr: String,
    },

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("no leader yet")]
    NoLeader,

    #[error("Leader unreachable at {address}: {reason}")]
    LeaderUnreachable { address: String, reason: String },

    // Membership errors
    #[error("Join failed: {0}")]
    Join(String),

    // Log store errors
    #[error("Log store error: {0}")]
    Store(String),

    #[error("Log entry encoding error: {0}")]
    EntryEncoding(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable by the caller.
    ///
    /// Execution errors are never retryable: the statement was committed to
    /// the log and deterministically failed on every node. Replication and
    /// forwarding errors happen before anything is applied, so the caller
    /// may safely resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Replication(_)
                | Error::NotLeader(_)
                | Error::NoLeader
                | Error::LeaderUnreachable { .. }
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NoLeader.is_retryable());
        assert!(Error::Replication("no quorum".into()).is_retryable());
        assert!(!Error::Execution {
            message: "syntax error".into(),
            stderr: "Error: syntax error".into(),
        }
        .is_retryable());
    }
}
