//! Error types for the Rosiwit domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Rosiwit operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool-protocol errors ---
    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    // --- Context window errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures talking to a tool server.
///
/// Connection-level variants are raised by `connect` and isolated per server
/// by the registry. Call-level variants are converted into result envelopes
/// before they reach the agent loop.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{server}': {reason}")]
    Spawn { server: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("MCP server '{0}' disconnected")]
    Disconnected(String),

    #[error("Tool '{0}' not found in any connected MCP server")]
    ToolNotFound(String),

    #[error("Tool '{name}' is provided by several servers: {servers}")]
    AmbiguousTool { name: String, servers: String },

    #[error("Tool '{tool}' failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Failures surfaced by the context window.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    /// A change listener rejected a notification. Listeners registered after
    /// it were not called for that pass.
    #[error("Listener #{listener} failed: {reason}")]
    Listener { listener: u64, reason: String },
}
