//! The protocol client: one connection to one MCP server.
//!
//! `connect` opens the transport, runs the `initialize` handshake and
//! discovers the server's tools once. Tool calls never fail outward; every
//! failure is folded into a [`ToolResult`] envelope.

use std::time::Duration;

use rosiwit_config::{McpConfig, ServerDescriptor, TransportKind};
use rosiwit_core::tool::render_content_blocks;
use rosiwit_core::{McpError, ToolCall, ToolDescriptor, ToolResult};
use tracing::{debug, info, warn};

use crate::protocol::{InitializeParams, InitializeResult, ServerInfo, ToolCallOutcome, ToolsListResult};
use crate::transport::{Connector, Transport};

/// Deadlines applied by the client.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Covers opening the transport, the handshake and tool discovery.
    pub connect_timeout: Duration,
    /// Covers a single `tools/call`.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&McpConfig::default())
    }
}

impl From<&McpConfig> for ClientOptions {
    fn from(config: &McpConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// A live connection to one server, with its cached tool catalog.
pub struct McpClient {
    name: String,
    kind: TransportKind,
    transport: Box<dyn Transport>,
    tools: Vec<ToolDescriptor>,
    server_info: ServerInfo,
    connected: bool,
    request_timeout: Duration,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("tools", &self.tools.len())
            .field("connected", &self.connected)
            .finish()
    }
}

impl McpClient {
    /// Open a transport for `descriptor`, handshake, and list its tools.
    pub async fn connect(
        descriptor: &ServerDescriptor,
        connector: &dyn Connector,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let name = descriptor.name.as_str();
        info!(server = %name, transport = %descriptor.kind(), "Connecting to MCP server");

        let transport = with_deadline(
            options.connect_timeout,
            format!("connect to '{name}'"),
            connector.open(descriptor),
        )
        .await?;

        let setup = with_deadline(
            options.connect_timeout,
            format!("handshake with '{name}'"),
            handshake_and_discover(transport.as_ref()),
        )
        .await;

        let (server_info, tools) = match setup {
            Ok(found) => found,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!(server = %name, error = %close_err, "Close after failed handshake");
                }
                return Err(match e {
                    e @ McpError::Timeout { .. } => e,
                    other => McpError::Handshake {
                        server: name.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        info!(
            server = %name,
            remote = %server_info.name,
            version = %server_info.version,
            tools = tools.len(),
            "MCP server connected"
        );

        Ok(Self {
            name: name.to_string(),
            kind: descriptor.kind(),
            transport,
            tools,
            server_info,
            connected: true,
            request_timeout: options.request_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Tools discovered at connect time.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Flips only through `connect` and `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Invoke a tool. Failures come back as an error envelope.
    pub async fn call_tool(&self, call: &ToolCall) -> ToolResult {
        if !self.connected {
            return ToolResult::failure(call, McpError::Disconnected(self.name.clone()).to_string());
        }

        debug!(server = %self.name, tool = %call.name, "Calling MCP tool");

        let params = serde_json::json!({
            "name": call.name,
            "arguments": call.arguments,
        });

        let outcome = with_deadline(
            self.request_timeout,
            format!("tools/call '{}'", call.name),
            self.transport.request("tools/call", Some(params)),
        )
        .await;

        match outcome {
            Ok(payload) => {
                let flags: ToolCallOutcome = serde_json::from_value(payload.clone()).unwrap_or_default();
                if flags.is_error {
                    let message = render_content_blocks(&payload);
                    warn!(server = %self.name, tool = %call.name, error = %message, "Tool reported an error");
                    ToolResult::failure(call, message)
                } else {
                    ToolResult::success(call, payload)
                }
            }
            Err(e) => {
                warn!(server = %self.name, tool = %call.name, error = %e, "Tool call failed");
                ToolResult::failure(call, e.to_string())
            }
        }
    }

    /// Close the transport. Failures are logged, never returned.
    pub async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.transport.close().await {
            warn!(server = %self.name, error = %e, "Error while disconnecting MCP server");
        }
        self.connected = false;
        info!(server = %self.name, "MCP server disconnected");
    }
}

async fn with_deadline<T, F>(limit: Duration, operation: String, fut: F) -> Result<T, McpError>
where
    F: std::future::Future<Output = Result<T, McpError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| McpError::Timeout {
            operation,
            secs: limit.as_secs(),
        })?
}

async fn handshake_and_discover(
    transport: &dyn Transport,
) -> Result<(ServerInfo, Vec<ToolDescriptor>), McpError> {
    let params = serde_json::to_value(InitializeParams::rosiwit())?;
    let result = transport.request("initialize", Some(params)).await?;
    let init: InitializeResult = serde_json::from_value(result)?;

    transport.notify("notifications/initialized", None).await?;

    let tools = list_all_tools(transport).await?;
    Ok((init.server_info, tools))
}

/// `tools/list`, following `nextCursor` until the server stops returning one.
async fn list_all_tools(transport: &dyn Transport) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let result = transport.request("tools/list", params).await?;
        let page: ToolsListResult = serde_json::from_value(result)?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next);
            }
            _ => break,
        }
    }

    Ok(tools)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use rosiwit_config::TransportConfig;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted in-process server.
    #[derive(Default)]
    pub(crate) struct MockServer {
        pub pages: Vec<(Vec<&'static str>, Option<&'static str>)>,
        pub fail_initialize: bool,
        pub hang_initialize: bool,
        pub init_delay: Duration,
        pub fail_tools: Vec<&'static str>,
        pub error_tools: Vec<&'static str>,
        pub fail_close: bool,
    }

    pub(crate) struct MockTransport {
        pub server: Arc<MockServer>,
        pub calls: Arc<Mutex<Vec<String>>>,
        pub closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
            self.calls.lock().unwrap().push(method.to_string());
            match method {
                "initialize" => {
                    if self.server.hang_initialize {
                        std::future::pending::<()>().await;
                    }
                    if !self.server.init_delay.is_zero() {
                        tokio::time::sleep(self.server.init_delay).await;
                    }
                    if self.server.fail_initialize {
                        return Err(McpError::Rpc { code: -32603, message: "boom".into() });
                    }
                    Ok(json!({ "protocolVersion": "2024-11-05", "serverInfo": { "name": "mock", "version": "1" } }))
                }
                "tools/list" => {
                    let cursor = params
                        .as_ref()
                        .and_then(|p| p.get("cursor"))
                        .and_then(|c| c.as_str())
                        .map(str::to_string);
                    let index = match cursor {
                        None => 0,
                        Some(c) => c.trim_start_matches('p').parse::<usize>().unwrap(),
                    };
                    let (names, next) = self.server.pages.get(index).cloned().unwrap_or_default();
                    let tools: Vec<Value> = names.iter().map(|n| json!({ "name": n })).collect();
                    Ok(json!({ "tools": tools, "nextCursor": next }))
                }
                "tools/call" => {
                    let params = params.unwrap_or_default();
                    let name = params["name"].as_str().unwrap_or_default().to_string();
                    if self.server.fail_tools.contains(&name.as_str()) {
                        return Err(McpError::Rpc { code: -32000, message: format!("{name} exploded") });
                    }
                    if self.server.error_tools.contains(&name.as_str()) {
                        return Ok(json!({ "isError": true, "content": [{ "type": "text", "text": "bad input" }] }));
                    }
                    Ok(json!({ "content": [{ "type": "text", "text": format!("{name}:{}", params["arguments"]) }] }))
                }
                other => Err(McpError::Protocol(format!("unexpected {other}"))),
            }
        }

        async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
            self.calls.lock().unwrap().push(method.to_string());
            Ok(())
        }

        async fn close(&self) -> Result<(), McpError> {
            self.closed.store(true, Ordering::SeqCst);
            if self.server.fail_close {
                return Err(McpError::Protocol("close failed".into()));
            }
            Ok(())
        }
    }

    /// Connector keyed by server name. Unknown names fail to spawn.
    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub servers: HashMap<String, Arc<MockServer>>,
        pub calls: Arc<Mutex<Vec<String>>>,
        pub closed: Arc<AtomicBool>,
    }

    impl MockConnector {
        pub fn with_server(mut self, name: &str, server: MockServer) -> Self {
            self.servers.insert(name.to_string(), Arc::new(server));
            self
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, descriptor: &ServerDescriptor) -> Result<Box<dyn Transport>, McpError> {
            let server = self.servers.get(&descriptor.name).ok_or_else(|| McpError::Spawn {
                server: descriptor.name.clone(),
                reason: "no such command".into(),
            })?;
            Ok(Box::new(MockTransport {
                server: Arc::clone(server),
                calls: Arc::clone(&self.calls),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    pub(crate) fn descriptor(name: &str) -> ServerDescriptor {
        ServerDescriptor::new(
            name,
            TransportConfig::Stdio {
                command: "mock".into(),
                args: vec![],
                env: BTreeMap::new(),
            },
        )
    }

    pub(crate) fn single_page(names: Vec<&'static str>) -> Vec<(Vec<&'static str>, Option<&'static str>)> {
        vec![(names, None)]
    }

    #[tokio::test]
    async fn connect_handshakes_then_lists_tools() {
        let connector = MockConnector::default().with_server(
            "fs",
            MockServer {
                pages: single_page(vec!["read_file", "write_file"]),
                ..MockServer::default()
            },
        );

        let client = McpClient::connect(&descriptor("fs"), &connector, ClientOptions::default())
            .await
            .unwrap();

        assert!(client.is_connected());
        assert_eq!(client.tools().len(), 2);
        assert!(client.has_tool("write_file"));
        assert_eq!(client.server_info().name, "mock");
        assert_eq!(
            *connector.calls.lock().unwrap(),
            vec!["initialize", "notifications/initialized", "tools/list"]
        );
    }

    #[tokio::test]
    async fn discovery_follows_cursor() {
        let connector = MockConnector::default().with_server(
            "paged",
            MockServer {
                pages: vec![(vec!["a", "b"], Some("p1")), (vec!["c"], Some("p2")), (vec!["d"], None)],
                ..MockServer::default()
            },
        );

        let client = McpClient::connect(&descriptor("paged"), &connector, ClientOptions::default())
            .await
            .unwrap();
        let names: Vec<_> = client.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn failed_handshake_is_reported_and_transport_closed() {
        let connector = MockConnector::default().with_server(
            "broken",
            MockServer {
                fail_initialize: true,
                ..MockServer::default()
            },
        );

        let err = McpClient::connect(&descriptor("broken"), &connector, ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Handshake { ref server, .. } if server == "broken"));
        assert!(connector.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_handshake_times_out() {
        let connector = MockConnector::default().with_server(
            "slow",
            MockServer {
                hang_initialize: true,
                ..MockServer::default()
            },
        );
        let options = ClientOptions {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
        };

        let err = McpClient::connect(&descriptor("slow"), &connector, options)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { secs: 2, .. }));
    }

    #[tokio::test]
    async fn call_failures_become_envelopes() {
        let connector = MockConnector::default().with_server(
            "fs",
            MockServer {
                pages: single_page(vec!["ok", "explode", "refuse"]),
                fail_tools: vec!["explode"],
                error_tools: vec!["refuse"],
                ..MockServer::default()
            },
        );
        let client = McpClient::connect(&descriptor("fs"), &connector, ClientOptions::default())
            .await
            .unwrap();

        let ok = client.call_tool(&ToolCall::new("1", "ok", json!({ "x": 1 }))).await;
        assert!(!ok.is_error());
        assert_eq!(ok.to_content(), "ok:{\"x\":1}");

        let exploded = client.call_tool(&ToolCall::new("2", "explode", json!({}))).await;
        assert!(exploded.error.as_deref().unwrap().contains("explode exploded"));

        let refused = client.call_tool(&ToolCall::new("3", "refuse", json!({}))).await;
        assert_eq!(refused.error.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn disconnect_swallows_close_errors() {
        let connector = MockConnector::default().with_server(
            "flaky",
            MockServer {
                fail_close: true,
                ..MockServer::default()
            },
        );
        let mut client = McpClient::connect(&descriptor("flaky"), &connector, ClientOptions::default())
            .await
            .unwrap();

        client.disconnect().await;
        assert!(!client.is_connected());

        let result = client.call_tool(&ToolCall::new("1", "anything", json!({}))).await;
        assert!(result.is_error());
    }
}
