//! Error types for bridge transports

use std::time::Duration;

/// Error type for a single bridge request or session operation
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Cannot connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No response from 0x{address:08x} after {elapsed:?}")]
    Timeout { address: u32, elapsed: Duration },

    #[error("Bridge is not open")]
    NotOpen,

    #[error("Link closed by peer")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T = ()> = Result<T, BridgeError>;
