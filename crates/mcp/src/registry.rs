//! The client registry: every configured MCP server behind one object.
//!
//! Constructed once at startup and passed by reference. `initialize`
//! connects all enabled servers concurrently and tolerates any subset
//! failing; `shutdown` disconnects everything and never fails.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use rosiwit_config::{McpConfig, McpRegistryFile, ServerDescriptor, ToolNamePolicy};
use rosiwit_core::{
    DomainEvent, EventBus, FunctionTool, McpError, MessageToolCall, ToolCall, ToolDescriptor,
    ToolResult,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::{ClientOptions, McpClient};
use crate::transport::{Connector, TransportConnector};

/// Per-server connection report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: String,
    pub connected: bool,
    pub tools: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a connect pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub connected: usize,
    pub total: usize,
}

impl Connectivity {
    /// True iff at least one server is connected.
    pub fn is_connected(&self) -> bool {
        self.connected > 0
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.connected, self.total)
    }
}

enum Slot {
    Idle,
    Connected(McpClient),
    Failed(String),
}

struct Entry {
    descriptor: ServerDescriptor,
    slot: Slot,
}

impl Entry {
    fn client(&self) -> Option<&McpClient> {
        match &self.slot {
            Slot::Connected(client) if client.is_connected() => Some(client),
            _ => None,
        }
    }
}

pub struct ClientRegistry {
    entries: RwLock<Vec<Entry>>,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    policy: ToolNamePolicy,
    events: Option<Arc<EventBus>>,
}

impl ClientRegistry {
    /// Registry over the given servers. Disabled descriptors are dropped here.
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        let entries = servers
            .into_iter()
            .filter(|d| !d.disabled)
            .map(|descriptor| Entry {
                descriptor,
                slot: Slot::Idle,
            })
            .collect();

        Self {
            entries: RwLock::new(entries),
            connector: Arc::new(TransportConnector),
            options: ClientOptions::default(),
            policy: ToolNamePolicy::default(),
            events: None,
        }
    }

    /// Registry over the enabled servers of a registry file, with client settings.
    pub fn from_config(file: &McpRegistryFile, config: &McpConfig) -> Self {
        Self::new(file.enabled_servers())
            .with_options(ClientOptions::from(config))
            .with_policy(config.tool_name_policy)
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: ToolNamePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Connect every server at once and wait for all attempts to settle.
    ///
    /// A failing server is recorded and logged; it never affects its
    /// siblings. Calling this again reconnects from scratch.
    pub async fn initialize(&self) -> Connectivity {
        let mut entries = self.entries.write().await;

        for entry in entries.iter_mut() {
            if let Slot::Connected(client) = &mut entry.slot {
                client.disconnect().await;
            }
            entry.slot = Slot::Idle;
        }

        let connector = self.connector.as_ref();
        let options = self.options;
        let attempts = entries
            .iter()
            .map(|entry| McpClient::connect(&entry.descriptor, connector, options));
        let outcomes = join_all(attempts).await;

        for (entry, outcome) in entries.iter_mut().zip(outcomes) {
            entry.slot = match outcome {
                Ok(client) => Slot::Connected(client),
                Err(e) => {
                    warn!(server = %entry.descriptor.name, error = %e, "MCP server failed to connect");
                    Slot::Failed(e.to_string())
                }
            };
        }

        let connectivity = Connectivity {
            connected: entries.iter().filter(|e| e.client().is_some()).count(),
            total: entries.len(),
        };

        log_duplicates(&entries, self.policy);

        info!(
            connected = connectivity.connected,
            total = connectivity.total,
            "MCP registry initialized"
        );

        if let Some(events) = &self.events {
            events.publish(DomainEvent::ServersInitialized {
                connected: connectivity.connected,
                total: connectivity.total,
                timestamp: Utc::now(),
            });
        }

        connectivity
    }

    pub async fn connectivity(&self) -> Connectivity {
        let entries = self.entries.read().await;
        Connectivity {
            connected: entries.iter().filter(|e| e.client().is_some()).count(),
            total: entries.len(),
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.connectivity().await.connected
    }

    /// Number of enabled servers.
    pub async fn total(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_connected(&self) -> bool {
        self.connectivity().await.is_connected()
    }

    /// Per-server report in registry order.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|entry| {
                let (connected, tools, error) = match &entry.slot {
                    Slot::Connected(client) => (client.is_connected(), client.tools().len(), None),
                    Slot::Failed(error) => (false, 0, Some(error.clone())),
                    Slot::Idle => (false, 0, None),
                };
                ServerStatus {
                    name: entry.descriptor.name.clone(),
                    transport: entry.descriptor.kind().to_string(),
                    connected,
                    tools,
                    error,
                }
            })
            .collect()
    }

    /// Aggregated catalog of connected servers, in registry order.
    ///
    /// Each name appears once: under `FirstMatch` the first server wins,
    /// under `Unique` duplicated names are left out.
    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let entries = self.entries.read().await;
        let duplicated = duplicated_names(&entries);
        let mut seen = HashSet::new();

        entries
            .iter()
            .filter_map(Entry::client)
            .flat_map(|client| client.tools().iter())
            .filter(|tool| match self.policy {
                ToolNamePolicy::FirstMatch => true,
                ToolNamePolicy::Unique => !duplicated.contains_key(tool.name.as_str()),
            })
            .filter(|tool| seen.insert(tool.name.clone()))
            .cloned()
            .collect()
    }

    /// The catalog as `{"type":"function",...}` entries for the model.
    pub async fn get_function_tools(&self) -> Vec<FunctionTool> {
        self.get_all_tools()
            .await
            .iter()
            .map(ToolDescriptor::to_function_tool)
            .collect()
    }

    /// Run one tool call. Never fails; problems come back in the envelope.
    pub async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        let entries = self.entries.read().await;
        self.execute_in(&entries, call).await
    }

    /// Run a batch strictly in order, one at a time, one result per call.
    ///
    /// Argument text that is not valid JSON yields an error envelope for
    /// that call; the rest of the batch still runs.
    pub async fn execute_tool_calls(&self, calls: &[MessageToolCall]) -> Vec<ToolResult> {
        let entries = self.entries.read().await;
        let mut results = Vec::with_capacity(calls.len());

        for invocation in calls {
            let result = match invocation.parsed_arguments() {
                Ok(arguments) => {
                    let call = ToolCall::new(&invocation.id, &invocation.name, arguments);
                    self.execute_in(&entries, &call).await
                }
                Err(e) => {
                    let call = ToolCall::new(
                        &invocation.id,
                        &invocation.name,
                        serde_json::Value::String(invocation.arguments.clone()),
                    );
                    warn!(tool = %invocation.name, error = %e, "Malformed tool arguments");
                    ToolResult::failure(
                        &call,
                        format!("Invalid JSON arguments for tool '{}': {e}", invocation.name),
                    )
                }
            };
            results.push(result);
        }

        results
    }

    async fn execute_in(&self, entries: &[Entry], call: &ToolCall) -> ToolResult {
        let started = Instant::now();

        let result = match route(entries, &call.name, self.policy) {
            Ok(client) => client.call_tool(call).await,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool call not routed");
                ToolResult::failure(call, e.to_string())
            }
        };

        if let Some(events) = &self.events {
            events.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                success: !result.is_error(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });
        }

        result
    }

    /// Disconnect every server. Errors are logged and swallowed.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut() {
            if let Slot::Connected(client) = &mut entry.slot {
                client.disconnect().await;
            }
        }
        info!("MCP registry shut down");
    }
}

/// Tool names offered by more than one connected server, with the servers offering them.
fn duplicated_names(entries: &[Entry]) -> BTreeMap<&str, Vec<&str>> {
    let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for client in entries.iter().filter_map(Entry::client) {
        for tool in client.tools() {
            owners.entry(tool.name.as_str()).or_default().push(client.name());
        }
    }
    owners.retain(|_, servers| servers.len() > 1);
    owners
}

fn log_duplicates(entries: &[Entry], policy: ToolNamePolicy) {
    for (tool, servers) in duplicated_names(entries) {
        match policy {
            ToolNamePolicy::FirstMatch => {
                debug!(tool = %tool, winner = %servers[0], shadowed = ?&servers[1..], "Duplicate tool name");
            }
            ToolNamePolicy::Unique => {
                warn!(tool = %tool, servers = ?servers, "Duplicate tool name withheld from catalog");
            }
        }
    }
}

/// First connected server, in registry order, whose catalog has `name`.
fn route<'a>(entries: &'a [Entry], name: &str, policy: ToolNamePolicy) -> Result<&'a McpClient, McpError> {
    let mut owners = entries
        .iter()
        .filter_map(Entry::client)
        .filter(|client| client.has_tool(name));

    let first = owners
        .next()
        .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;

    if policy == ToolNamePolicy::Unique {
        let others: Vec<&str> = owners.map(McpClient::name).collect();
        if !others.is_empty() {
            let servers = std::iter::once(first.name())
                .chain(others)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(McpError::AmbiguousTool {
                name: name.to_string(),
                servers,
            });
        }
    }

    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{descriptor, single_page, MockConnector, MockServer};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry(connector: MockConnector, names: &[&str]) -> (ClientRegistry, Arc<MockConnector>) {
        let connector = Arc::new(connector);
        let registry = ClientRegistry::new(names.iter().map(|n| descriptor(n)).collect())
            .with_connector(connector.clone());
        (registry, connector)
    }

    fn server(tools: Vec<&'static str>) -> MockServer {
        MockServer {
            pages: single_page(tools),
            ..MockServer::default()
        }
    }

    #[tokio::test]
    async fn partial_failure_leaves_registry_usable() {
        let connector = MockConnector::default()
            .with_server("alpha", server(vec!["a1"]))
            .with_server("gamma", server(vec!["g1", "g2"]));
        let (registry, _) = registry(connector, &["alpha", "beta", "gamma"]);

        let connectivity = registry.initialize().await;
        assert_eq!(connectivity, Connectivity { connected: 2, total: 3 });
        assert!(connectivity.is_connected());
        assert_eq!(connectivity.to_string(), "2/3");

        let names: Vec<_> = registry.get_all_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a1", "g1", "g2"]);

        let status = registry.status().await;
        assert_eq!(status[1].name, "beta");
        assert!(!status[1].connected);
        assert!(status[1].error.as_deref().unwrap().contains("beta"));
        assert_eq!(status[2].tools, 2);
    }

    fn delayed(tools: Vec<&'static str>, secs: u64) -> MockServer {
        MockServer {
            init_delay: Duration::from_secs(secs),
            ..server(tools)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn startup_waits_for_the_slowest_server_only() {
        let connector = MockConnector::default()
            .with_server("one", delayed(vec!["t1"], 1))
            .with_server("two", delayed(vec!["t2"], 2))
            .with_server("three", delayed(vec!["t3"], 3));
        let (registry, _) = registry(connector, &["one", "two", "three"]);

        let started = tokio::time::Instant::now();
        let connectivity = registry.initialize().await;
        let elapsed = started.elapsed();

        assert_eq!(connectivity, Connectivity { connected: 3, total: 3 });
        // Sequential connects would take 6s
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_server_times_out_without_holding_back_siblings() {
        let connector = MockConnector::default()
            .with_server("quick", delayed(vec!["q"], 1))
            .with_server("stuck", MockServer {
                hang_initialize: true,
                ..server(vec!["never"])
            })
            .with_server("steady", delayed(vec!["s"], 2));
        let (registry, _) = registry(connector, &["quick", "stuck", "steady"]);
        let registry = registry.with_options(ClientOptions {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        });

        let started = tokio::time::Instant::now();
        let connectivity = registry.initialize().await;
        let elapsed = started.elapsed();

        assert_eq!(connectivity, Connectivity { connected: 2, total: 3 });
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");

        let status = registry.status().await;
        assert!(status[0].connected && status[2].connected);
        assert!(!status[1].connected);
        assert!(status[1].error.is_some());

        let names: Vec<_> = registry.get_all_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["q", "s"]);
    }

    #[tokio::test]
    async fn all_failing_means_not_connected() {
        let (registry, _) = registry(MockConnector::default(), &["x", "y"]);
        let connectivity = registry.initialize().await;
        assert_eq!(connectivity.connected, 0);
        assert!(!registry.is_connected().await);
        assert!(registry.get_all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_servers_are_not_attempted() {
        let connector = Arc::new(MockConnector::default().with_server("on", server(vec!["t"])));
        let registry = ClientRegistry::new(vec![
            descriptor("on"),
            descriptor("off").with_disabled(true),
        ])
        .with_connector(connector);

        registry.initialize().await;
        assert_eq!(registry.total().await, 1);
        assert_eq!(registry.connected_count().await, 1);
    }

    #[tokio::test]
    async fn batch_runs_in_order_and_isolates_failures() {
        let connector = MockConnector::default().with_server(
            "tools",
            MockServer {
                pages: single_page(vec!["first", "second", "third"]),
                fail_tools: vec!["second"],
                ..MockServer::default()
            },
        );
        let (registry, connector) = registry(connector, &["tools"]);
        registry.initialize().await;

        let calls = vec![
            MessageToolCall::new("c1", "first", r#"{"n":1}"#),
            MessageToolCall::new("c2", "second", "{}"),
            MessageToolCall::new("c3", "third", ""),
        ];
        let results = registry.execute_tool_calls(&calls).await;

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.call_id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2", "c3"]
        );
        assert!(results[0].output.is_some() && results[0].error.is_none());
        assert!(!results[1].error.as_deref().unwrap_or_default().is_empty());
        assert!(results[2].output.is_some() && results[2].error.is_none());
        assert_eq!(results[2].arguments, json!({}));

        let tool_calls = connector
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == "tools/call")
            .count();
        assert_eq!(tool_calls, 3);
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_json_become_envelopes() {
        let connector = MockConnector::default().with_server("tools", server(vec!["echo"]));
        let (registry, _) = registry(connector, &["tools"]);
        registry.initialize().await;

        let results = registry
            .execute_tool_calls(&[
                MessageToolCall::new("c1", "nope", "{}"),
                MessageToolCall::new("c2", "echo", "{\"a\":"),
                MessageToolCall::new("c3", "echo", "{\"a\":1}"),
            ])
            .await;

        assert_eq!(
            results[0].error.as_deref(),
            Some("Tool 'nope' not found in any connected MCP server")
        );
        assert!(results[1].error.as_deref().unwrap().starts_with("Invalid JSON arguments"));
        assert_eq!(results[1].arguments, json!("{\"a\":"));
        assert!(!results[2].is_error());
    }

    #[tokio::test]
    async fn first_match_routes_to_earliest_server() {
        let connector = MockConnector::default()
            .with_server("a", server(vec!["shared", "only_a"]))
            .with_server("b", server(vec!["shared"]));
        let (registry, _) = registry(connector, &["a", "b"]);
        registry.initialize().await;

        let names: Vec<_> = registry.get_all_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["shared", "only_a"]);

        let result = registry
            .execute_tool(&ToolCall::new("c1", "shared", json!({})))
            .await;
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn unique_policy_withholds_and_refuses_duplicates() {
        let connector = MockConnector::default()
            .with_server("a", server(vec!["shared", "only_a"]))
            .with_server("b", server(vec!["shared"]));
        let (registry, _) = registry(connector, &["a", "b"]);
        let registry = registry.with_policy(ToolNamePolicy::Unique);
        registry.initialize().await;

        let names: Vec<_> = registry.get_all_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["only_a"]);

        let result = registry
            .execute_tool(&ToolCall::new("c1", "shared", json!({})))
            .await;
        let error = result.error.unwrap();
        assert!(error.contains("several servers"));
        assert!(error.contains("a, b"));
    }

    #[tokio::test]
    async fn function_catalog_applies_defaults() {
        let connector = MockConnector::default().with_server("tools", server(vec!["bare"]));
        let (registry, _) = registry(connector, &["tools"]);
        registry.initialize().await;

        let catalog = registry.get_function_tools().await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].tool_type, "function");
        assert_eq!(catalog[0].function.description, "Execute bare");
    }

    #[tokio::test]
    async fn shutdown_never_fails_and_disconnects() {
        let connector = MockConnector::default().with_server(
            "flaky",
            MockServer {
                fail_close: true,
                ..server(vec!["t"])
            },
        );
        let (registry, connector) = registry(connector, &["flaky"]);
        registry.initialize().await;
        assert!(registry.is_connected().await);

        registry.shutdown().await;
        assert!(connector.closed.load(Ordering::SeqCst));
        assert!(!registry.is_connected().await);

        let result = registry.execute_tool(&ToolCall::new("c1", "t", json!({}))).await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn tool_events_are_published() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let connector = MockConnector::default().with_server("tools", server(vec!["echo"]));
        let (registry, _) = registry(connector, &["tools"]);
        let registry = registry.with_event_bus(bus);

        registry.initialize().await;
        registry.execute_tool(&ToolCall::new("c1", "echo", json!({}))).await;

        match rx.recv().await.unwrap().as_ref() {
            DomainEvent::ServersInitialized { connected, total, .. } => {
                assert_eq!((*connected, *total), (1, 1));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap().as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "echo");
                assert!(success);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
