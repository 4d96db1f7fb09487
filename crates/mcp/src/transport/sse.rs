//! SSE transport: server-to-client messages arrive on a long-lived
//! `text/event-stream` GET, client-to-server messages are POSTed to the
//! endpoint the server announces in its first `endpoint` event.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Url;
use rosiwit_core::{LineBuffer, McpError};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Transport;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, PendingRequests, ServerMessage};

pub struct SseTransport {
    server: String,
    http: reqwest::Client,
    headers: HeaderMap,
    endpoint: Url,
    pending: PendingRequests,
    next_id: AtomicU64,
    disconnected: Arc<AtomicBool>,
    reader: Mutex<Option<ReaderTask>>,
}

/// The event-stream reader. Aborted when dropped, so an abandoned connect
/// or a transport dropped without `close` does not keep the GET open.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SseTransport {
    /// Open the event stream and wait for the server's `endpoint` event.
    pub async fn connect(
        server: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        let base = Url::parse(url).map_err(|e| McpError::Http(format!("invalid URL '{url}': {e}")))?;
        let headers = header_map(headers)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| McpError::Http(e.to_string()))?;

        let response = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(McpError::Http(format!(
                "event stream at {url} returned {}",
                response.status()
            )));
        }

        let pending = PendingRequests::new();
        let disconnected = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = ReaderTask(tokio::spawn(read_event_stream(
            server.to_string(),
            response,
            endpoint_tx,
            pending.clone(),
            Arc::clone(&disconnected),
        )));

        let endpoint = match endpoint_rx.await {
            Ok(path) => base
                .join(&path)
                .map_err(|e| McpError::Protocol(format!("bad endpoint '{path}': {e}")))?,
            Err(_) => {
                return Err(McpError::Handshake {
                    server: server.to_string(),
                    reason: "event stream closed before an endpoint was announced".into(),
                });
            }
        };

        debug!(server = %server, endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            server: server.to_string(),
            http,
            headers,
            endpoint,
            pending,
            next_id: AtomicU64::new(1),
            disconnected,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    async fn post<T: serde::Serialize>(&self, message: &T) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| McpError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http(format!("POST {} returned {status}: {body}", self.endpoint)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if !self.is_connected() {
            return Err(McpError::Disconnected(self.server.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let waiter = self.pending.register(id);

        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let response = waiter
            .recv()
            .await
            .map_err(|_| McpError::Disconnected(self.server.clone()))?;
        Ok(response.into_result()?)
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::Disconnected(self.server.clone()));
        }
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        drop(self.reader.lock().await.take());
        self.disconnected.store(true, Ordering::Release);
        self.pending.fail_all();
        Ok(())
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Http(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Http(format!("invalid value for header '{}': {e}", name.as_str())))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// One parsed server-sent event.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        for line in self.lines.push(bytes) {
            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    events.push(SseEvent {
                        event: self.event.take().unwrap_or_else(|| "message".into()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }

            // Comment / keep-alive
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

async fn read_event_stream(
    server: String,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: PendingRequests,
    disconnected: Arc<AtomicBool>,
) {
    let mut byte_stream = response.bytes_stream();
    let mut parser = SseParser::default();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk) = byte_stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                warn!(server = %server, error = %e, "SSE stream error");
                break;
            }
        };

        for event in parser.push(&bytes) {
            match event.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                }
                "message" => match ServerMessage::from_line(&event.data) {
                    Ok(ServerMessage::Response(resp)) => {
                        if !pending.resolve(resp) {
                            debug!(server = %server, "Dropping response for unknown request id");
                        }
                    }
                    Ok(ServerMessage::Notification(notif)) => {
                        debug!(server = %server, method = %notif.method, "MCP notification");
                    }
                    Err(e) => {
                        warn!(server = %server, error = %e, "Unparseable SSE message");
                    }
                },
                other => debug!(server = %server, event = %other, "Ignoring SSE event"),
            }
        }
    }

    info!(server = %server, "SSE stream closed");
    disconnected.store(true, Ordering::Release);
    pending.fail_all();
}
