//! JSON-RPC 2.0 protocol types for MCP communication.
//!
//! Implements the minimal set of JSON-RPC types needed for the MCP client:
//! requests, responses, notifications, and the handshake and discovery
//! payloads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rosiwit_core::ToolDescriptor;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version we announce.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 core types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request (has an `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: serde_json::Value::Number(id.into()),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: serde_json::Value::Number(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// Extract the result, returning an error if the response was an error.
    pub fn into_result(self) -> Result<serde_json::Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(serde_json::Value::Null))
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<JsonRpcError> for rosiwit_core::McpError {
    fn from(e: JsonRpcError) -> Self {
        Self::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

/// An incoming message from an MCP server.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// A response to a client request (has `id`).
    Response(JsonRpcResponse),
    /// A server-initiated notification or request (has `method`).
    Notification(JsonRpcNotification),
}

impl ServerMessage {
    /// Parse one JSON text into a `ServerMessage`.
    ///
    /// Anything carrying a `method` is treated as a notification; servers
    /// may also send requests (e.g. `ping`), which this client does not answer.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        let raw: serde_json::Value = serde_json::from_str(line)?;

        if raw.get("method").is_some() {
            Ok(Self::Notification(serde_json::from_value(raw)?))
        } else {
            Ok(Self::Response(serde_json::from_value(raw)?))
        }
    }
}

// ---------------------------------------------------------------------------
// Pending request table
// ---------------------------------------------------------------------------

/// Response channels for in-flight requests, keyed by request id.
///
/// Shared between a transport and its reader task. The lock is never held
/// across an await.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request id and get the handle its response will arrive on.
    pub fn register(&self, id: u64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.table().insert(id, tx);
        PendingResponse {
            id,
            rx,
            table: self.clone(),
        }
    }

    /// Hand a response to whoever is waiting for it. Returns `false` for unknown ids.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.as_u64() else {
            return false;
        };
        match self.table().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub fn fail_all(&self) {
        self.table().clear();
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

/// One registered request. Dropping it, awaited or not, withdraws the id
/// from the table, so a cancelled request leaves nothing behind.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    table: PendingRequests,
}

impl PendingResponse {
    /// Wait for the response. Fails once the table is cleared.
    pub async fn recv(mut self) -> Result<JsonRpcResponse, oneshot::error::RecvError> {
        (&mut self.rx).await
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.table().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// MCP-specific types
// ---------------------------------------------------------------------------

/// Client info sent during initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Server info received during initialization.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters for the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

impl InitializeParams {
    pub fn rosiwit() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: "rosiwit".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub server_info: ServerInfo,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of `tools/call`. The raw payload is kept for rendering.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    #[serde(default)]
    pub is_error: bool,
}
