//! Transport adapters: one uniform request/notify/close surface over
//! subprocess pipes and HTTP event streams.

pub mod sse;
pub mod stdio;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

use async_trait::async_trait;
use rosiwit_config::{ServerDescriptor, TransportConfig};
use rosiwit_core::McpError;

/// A live JSON-RPC channel to one MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError>;

    /// Close the channel. Pending requests fail with `Disconnected`.
    async fn close(&self) -> Result<(), McpError>;
}

/// Opens transports for server descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Transport>, McpError>;
}

/// Opens the real stdio and SSE transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn open(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Transport>, McpError> {
        match &descriptor.transport {
            TransportConfig::Stdio { command, args, env } => {
                let transport = StdioTransport::spawn(&descriptor.name, command, args, env)?;
                Ok(Box::new(transport))
            }
            TransportConfig::Sse { url, headers } => {
                let transport = SseTransport::connect(&descriptor.name, url, headers).await?;
                Ok(Box::new(transport))
            }
        }
    }
}
