//! The agent reasoning loop implementation.

use std::sync::Arc;

use rosiwit_config::AppConfig;
use rosiwit_core::event::{DomainEvent, EventBus};
use rosiwit_core::message::Message;
use rosiwit_core::provider::{FunctionTool, Provider, ProviderRequest, Usage};
use rosiwit_mcp::ClientRegistry;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::assembler::{AssembledResponse, assemble};
use crate::context::ContextWindow;
use crate::context::token::estimate_tools_tokens;
use crate::stream_event::AgentStreamEvent;

/// Returned in place of an answer when the iteration limit is hit.
pub const MAX_ITERATIONS_MESSAGE: &str =
    "I've reached the maximum number of tool call iterations. Please provide further guidance.";

/// Outcome of one user request.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub content: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub usage: Option<Usage>,
}

/// The core agent loop that orchestrates streamed model calls and MCP tool
/// execution.
pub struct AgentLoop {
    /// The streaming provider to use
    provider: Arc<dyn Provider>,

    /// Connected MCP servers
    registry: Arc<ClientRegistry>,

    /// The model to use
    model: String,

    /// Temperature setting
    temperature: f32,

    /// Default max tokens per response
    max_tokens: Option<u32>,

    /// Maximum model round-trips per request
    max_iterations: usize,

    /// Event bus for domain events
    event_bus: Arc<EventBus>,
}

impl AgentLoop {
    /// Create a new agent loop.
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ClientRegistry>,
        model: impl Into<String>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            registry,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            max_iterations: 10,
            event_bus,
        }
    }

    /// Create an agent loop using model settings from config.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        registry: Arc<ClientRegistry>,
        config: &AppConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::new(provider, registry, &config.model, event_bus)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens)
            .with_max_iterations(config.agent.max_iterations)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the default max tokens per model response.
    pub fn with_max_tokens(mut self, max: Option<u32>) -> Self {
        self.max_tokens = max;
        self
    }

    /// Set the maximum number of model round-trips per request.
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Run the conversation in `context` to a final answer.
    ///
    /// The caller appends the user turn first. Each iteration:
    /// 1. Streams a response for the current window and the tool catalog
    /// 2. Reassembles tool calls from the streamed fragments
    /// 3. If there are none, appends the answer and returns
    /// 4. Otherwise runs the calls in order, appends one `tool` turn per
    ///    call and loops
    ///
    /// Visible text and tool activity go to `events` as they happen.
    pub async fn process(
        &self,
        context: &mut ContextWindow,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> rosiwit_core::Result<AgentResponse> {
        let tools = self.registry.get_function_tools().await;
        info!(
            model = %self.model,
            messages = context.len(),
            tools = tools.len(),
            "Processing request"
        );
        debug!(catalog_tokens = estimate_tools_tokens(&tools), "Tool catalog size");

        let mut tool_calls_made = 0;
        let mut usage: Option<Usage> = None;

        for iteration in 1..=self.max_iterations {
            debug!(iteration, "Agent loop iteration");

            let response = match self.stream_response(context, &tools, events).await {
                Ok(r) => r,
                Err(e) => {
                    emit(events, AgentStreamEvent::Error { message: e.to_string() }).await;
                    return Err(e);
                }
            };
            if response.usage.is_some() {
                usage = response.usage.clone();
            }

            if !response.has_tool_calls() {
                context.add_turn(Message::assistant(&response.content))?;
                return Ok(self
                    .finish(response.content, iteration, tool_calls_made, usage, events)
                    .await);
            }

            debug!(tool_count = response.tool_calls.len(), "Executing tool calls");
            context.add_turn(Message::assistant_with_tools(
                &response.content,
                response.tool_calls.clone(),
            ))?;

            for call in &response.tool_calls {
                emit(
                    events,
                    AgentStreamEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call
                            .parsed_arguments()
                            .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone())),
                    },
                )
                .await;

                let results = self
                    .registry
                    .execute_tool_calls(std::slice::from_ref(call))
                    .await;
                tool_calls_made += 1;

                for result in results {
                    let output = result.to_content();
                    emit(
                        events,
                        AgentStreamEvent::ToolResult {
                            id: result.call_id.clone(),
                            name: result.name.clone(),
                            output: output.clone(),
                            success: !result.is_error(),
                        },
                    )
                    .await;
                    context.add_turn(Message::tool_result(&result.call_id, output))?;
                }
            }
        }

        warn!(
            iterations = self.max_iterations,
            "Max tool iterations reached, stopping"
        );
        Ok(self
            .finish(
                MAX_ITERATIONS_MESSAGE.to_string(),
                self.max_iterations,
                tool_calls_made,
                usage,
                events,
            )
            .await)
    }

    /// One streamed model call, forwarding visible text as it arrives.
    async fn stream_response(
        &self,
        context: &ContextWindow,
        tools: &[FunctionTool],
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> rosiwit_core::Result<AssembledResponse> {
        let request = ProviderRequest::new(&self.model, context.messages().to_vec())
            .with_tools(tools.to_vec())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let chunks = ReceiverStream::new(self.provider.stream(request).await?);
        let response = assemble(chunks, |content| emit(events, AgentStreamEvent::Chunk { content })).await?;
        Ok(response)
    }

    async fn finish(
        &self,
        content: String,
        iterations: usize,
        tool_calls_made: usize,
        usage: Option<Usage>,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> AgentResponse {
        self.event_bus.publish(DomainEvent::ResponseGenerated {
            model: self.model.clone(),
            iterations,
            tool_calls: tool_calls_made,
            timestamp: chrono::Utc::now(),
        });

        emit(
            events,
            AgentStreamEvent::Done {
                usage: usage.clone(),
                iterations,
                tool_calls_made,
            },
        )
        .await;

        AgentResponse {
            content,
            iterations,
            tool_calls_made,
            usage,
        }
    }
}

async fn emit(events: Option<&mpsc::Sender<AgentStreamEvent>>, event: AgentStreamEvent) {
    if let Some(tx) = events {
        // A closed sink only means nobody is watching
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosiwit_core::error::ProviderError;
    use rosiwit_core::provider::{ChunkReceiver, StreamChunk, ToolCallDelta};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Script = Vec<Result<StreamChunk, ProviderError>>;

    /// Replays one scripted chunk sequence per `stream` call.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
            self.requests.lock().unwrap().push(request);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))?;

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                for chunk in script {
                    let _ = tx.send(chunk).await;
                }
            });
            Ok(rx)
        }
    }

    fn text(content: &str) -> Script {
        vec![Ok(StreamChunk::text(content)), Ok(StreamChunk::finished())]
    }

    fn tool_call(id: &str, name: &str, args: &str) -> Script {
        vec![
            Ok(StreamChunk::deltas(vec![ToolCallDelta::new(0).with_id(id).with_name(name)])),
            Ok(StreamChunk::deltas(vec![ToolCallDelta::new(0).with_arguments(args)])),
            Ok(StreamChunk::finished()),
        ]
    }

    fn agent(provider: Arc<ScriptedProvider>) -> AgentLoop {
        AgentLoop::new(
            provider,
            Arc::new(ClientRegistry::new(vec![])),
            "mock-model",
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn simple_text_response() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("Hello! How can I help?")]));
        let agent = agent(Arc::clone(&provider));

        let mut context = ContextWindow::default();
        context.add_turn(Message::system("sys")).unwrap();
        context.add_turn(Message::user("Hello!")).unwrap();

        let response = agent.process(&mut context, None).await.unwrap();
        assert_eq!(response.content, "Hello! How can I help?");
        assert_eq!(response.iterations, 1);
        // System + User + Assistant
        assert_eq!(context.len(), 3);
        assert_eq!(provider.requests.lock().unwrap()[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn text_fragments_stream_out_in_order() {
        let script = vec![
            Ok(StreamChunk::text("Hel")),
            Ok(StreamChunk::text("lo")),
            Ok(StreamChunk::text("!")),
            Ok(StreamChunk::finished()),
        ];
        let agent = agent(Arc::new(ScriptedProvider::new(vec![script])));

        let mut context = ContextWindow::default();
        context.add_turn(Message::user("hi")).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let response = agent.process(&mut context, Some(&tx)).await.unwrap();
        drop(tx);

        let mut fragments = Vec::new();
        let mut done = 0;
        while let Some(event) = rx.recv().await {
            match event {
                AgentStreamEvent::Chunk { content } => fragments.push(content),
                AgentStreamEvent::Done { .. } => done += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(fragments, vec!["Hel", "lo", "!"]);
        assert_eq!(done, 1);
        assert_eq!(response.content, "Hello!");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_turn_and_loop_continues() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("call_1", "missing", "{}"),
            text("Sorry, that tool is unavailable."),
        ]));
        let agent = agent(Arc::clone(&provider));

        let mut context = ContextWindow::default();
        context.add_turn(Message::user("do it")).unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        let response = agent.process(&mut context, Some(&tx)).await.unwrap();
        drop(tx);

        assert_eq!(response.iterations, 2);
        assert_eq!(response.tool_calls_made, 1);

        let tool_turn = &context.messages()[2];
        assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(
            tool_turn.content,
            "Error: Tool 'missing' not found in any connected MCP server"
        );

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds, vec!["tool_call", "tool_result", "chunk", "done"]);
    }

    #[tokio::test]
    async fn stops_at_max_iterations() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call("a", "t", "{}"),
            tool_call("b", "t", "{}"),
            tool_call("c", "t", "{}"),
        ]));
        let agent = agent(provider).with_max_iterations(2);

        let mut context = ContextWindow::default();
        context.add_turn(Message::user("loop")).unwrap();

        let response = agent.process(&mut context, None).await.unwrap();
        assert_eq!(response.content, MAX_ITERATIONS_MESSAGE);
        assert_eq!(response.iterations, 2);
        assert_eq!(response.tool_calls_made, 2);
    }

    #[tokio::test]
    async fn stream_error_is_reported_and_returned() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            Ok(StreamChunk::text("par")),
            Err(ProviderError::StreamInterrupted("reset".into())),
        ]]));
        let agent = agent(provider);

        let mut context = ContextWindow::default();
        context.add_turn(Message::user("hi")).unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        let result = agent.process(&mut context, Some(&tx)).await;
        drop(tx);

        assert!(matches!(
            result,
            Err(rosiwit_core::Error::Provider(ProviderError::StreamInterrupted(_)))
        ));
        assert_eq!(rx.recv().await.unwrap().event_type(), "chunk");
        assert_eq!(rx.recv().await.unwrap().event_type(), "error");
        // The partial answer is not recorded
        assert_eq!(context.len(), 1);
    }

    #[tokio::test]
    async fn publishes_response_generated() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe();
        let provider = Arc::new(ScriptedProvider::new(vec![text("ok")]));
        let agent = AgentLoop::new(
            provider,
            Arc::new(ClientRegistry::new(vec![])),
            "mock-model",
            Arc::clone(&bus),
        );

        let mut context = ContextWindow::default();
        context.add_turn(Message::user("hi")).unwrap();
        agent.process(&mut context, None).await.unwrap();

        let event = sub.recv().await.unwrap();
        assert!(matches!(
            &*event,
            DomainEvent::ResponseGenerated { iterations: 1, tool_calls: 0, .. }
        ));
    }
}
