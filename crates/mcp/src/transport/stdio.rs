//! Stdio transport: the server is a child process speaking newline-delimited
//! JSON-RPC over stdin/stdout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rosiwit_core::McpError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::Transport;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, PendingRequests, ServerMessage};

/// Time the child gets to exit after stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct StdioTransport {
    server: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<BufWriter<ChildStdin>>,
    pending: PendingRequests,
    next_id: AtomicU64,
    disconnected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the server process and start reading its stdout.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        let spawn_err = |reason: String| McpError::Spawn {
            server: server.to_string(),
            reason,
        };

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(server.to_string(), stderr);
        }

        let pending = PendingRequests::new();
        let disconnected = Arc::new(AtomicBool::new(false));

        spawn_reader_loop(
            server.to_string(),
            BufReader::new(stdout),
            pending.clone(),
            Arc::clone(&disconnected),
        );

        debug!(server = %server, command = %command, "Spawned MCP server process");

        Ok(Self {
            server: server.to_string(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(BufWriter::new(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            disconnected,
        })
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    async fn write_line<T: serde::Serialize>(&self, message: &T) -> Result<(), McpError> {
        let line = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
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

        self.write_line(&JsonRpcRequest::new(id, method, params)).await?;

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
        self.write_line(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        // EOF on stdin asks the server to exit
        let shutdown = self.writer.lock().await.shutdown().await;

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                warn!(server = %self.server, "MCP server did not exit, killing it");
                child.kill().await?;
            }
        }

        self.disconnected.store(true, Ordering::Release);
        self.pending.fail_all();

        // A server that already exited closes its stdin first
        match shutdown {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Read JSON-RPC lines from the server and dispatch responses to waiters.
fn spawn_reader_loop<R>(
    server: String,
    mut reader: BufReader<R>,
    pending: PendingRequests,
    disconnected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!(server = %server, "MCP server closed stdout");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match ServerMessage::from_line(trimmed) {
                        Ok(ServerMessage::Response(resp)) => {
                            if !pending.resolve(resp) {
                                debug!(server = %server, "Dropping response for unknown request id");
                            }
                        }
                        Ok(ServerMessage::Notification(notif)) => {
                            debug!(server = %server, method = %notif.method, "MCP notification");
                        }
                        Err(e) => {
                            // Servers sometimes log to stdout
                            debug!(server = %server, error = %e, line = %trimmed, "Ignoring non JSON-RPC line");
                        }
                    }
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "MCP server read error");
                    break;
                }
            }
        }

        disconnected.store(true, Ordering::Release);
        pending.fail_all();
    });
}

fn spawn_stderr_logger<R>(server: String, stderr: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %server, "stderr: {line}");
        }
    });
}
