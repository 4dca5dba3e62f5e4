// src/error.rs - Comprehensive error handling for XEPool
use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Main error type for pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Banned: {0}")]
    Banned(String),

    #[error("Upstream RPC error: {0}")]
    Upstream(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid block header: {0}")]
    BlockHeader(String),

    #[error("Unsupported algorithm: {0}")]
    Algorithm(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

impl PoolError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PoolError::Config(msg.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        PoolError::Transport(msg.into())
    }

    /// Create a new framing error
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        PoolError::Framing(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        PoolError::Protocol(msg.into())
    }

    /// Create a new upstream RPC error
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        PoolError::Upstream(msg.into())
    }

    /// Create a new persistence error
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        PoolError::Persistence(msg.into())
    }

    /// Check if the error should tear down the enclosing connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::Transport(_) | PoolError::Framing(_) | PoolError::Io(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PoolError::Config(_) => "config",
            PoolError::Transport(_) => "transport",
            PoolError::Framing(_) => "framing",
            PoolError::Protocol(_) => "protocol",
            PoolError::RateLimited(_) => "security",
            PoolError::Banned(_) => "security",
            PoolError::Upstream(_) => "upstream",
            PoolError::Persistence(_) => "database",
            PoolError::InvalidAddress(_) => "validation",
            PoolError::BlockHeader(_) => "validation",
            PoolError::Algorithm(_) => "validation",
            PoolError::Fatal(_) => "fatal",
            PoolError::Io(_) => "io",
            PoolError::Json(_) => "serialization",
            PoolError::RocksDb(_) => "database",
            PoolError::Bincode(_) => "serialization",
            PoolError::HexDecode(_) => "serialization",
        }
    }
}

impl From<String> for PoolError {
    fn from(err: String) -> Self {
        PoolError::Protocol(err)
    }
}

impl From<&str> for PoolError {
    fn from(err: &str) -> Self {
        PoolError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let config_err = PoolError::config("test");
        assert_eq!(config_err.category(), "config");

        let framing_err = PoolError::framing("tag mismatch");
        assert!(framing_err.is_connection_fatal());

        let upstream_err = PoolError::upstream("rpc down");
        assert!(!upstream_err.is_connection_fatal());
    }
}
