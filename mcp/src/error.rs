//! MCP proxy error types.
//!
//! Defines error variants for discovery, backend connections, routing,
//! token acquisition and engine lifecycle.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No backend servers available: {0}")]
    AggregateUnavailable(String),

    #[error("Ambiguous name '{name}': must include server prefix (available: {servers:?})")]
    AmbiguousName { name: String, servers: Vec<String> },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Token fetch failed: {0}")]
    TokenFetch(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Proxy has been disposed")]
    Disposed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Whether the failure belongs to a single backend and may be skipped
    /// while building the aggregate.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            McpError::Config(_)
                | McpError::ConnectionFailed(_)
                | McpError::Transport(_)
                | McpError::Timeout { .. }
                | McpError::TokenFetch(_)
                | McpError::Io(_)
                | McpError::Http(_)
        )
    }

    /// Errors that a reconnect attempt cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            McpError::Config(_) | McpError::Cancelled | McpError::Disposed
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            McpError::ServerNotFound(_)
                | McpError::ToolNotFound(_)
                | McpError::PromptNotFound(_)
                | McpError::ResourceNotFound(_)
        )
    }
}
