//! Error types for Parley Core

use thiserror::Error;

use parley_mcp::McpError;

/// Result type alias using Parley Error
pub type Result<T> = std::result::Result<T, Error>;

/// Parley error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Tool server '{0}' is not connected")]
    ToolServerUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Errors that warrant one reconnect-and-retry of a tool call
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Mcp(e) => e.is_transport(),
            _ => false,
        }
    }
}
