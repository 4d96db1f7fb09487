//! Tool-call reassembly from a streamed model response.
//!
//! Providers forward tool calls as fragments tagged with a position
//! index: the id and name usually arrive first, the JSON arguments trickle
//! in over many chunks. [`DeltaAssembler`] keeps one accumulator per
//! index and finalizes them in ascending index order once the stream ends.

use std::collections::BTreeMap;
use std::future::Future;

use futures::{Stream, StreamExt};
use rosiwit_core::error::ProviderError;
use rosiwit_core::message::{MessageToolCall, default_call_type};
use rosiwit_core::provider::{StreamChunk, ToolCallDelta, Usage};
use tracing::{debug, trace};

#[derive(Debug, Default, Clone)]
struct Accumulator {
    id: Option<String>,
    call_type: Option<String>,
    name: String,
    arguments: String,
}

impl Accumulator {
    fn apply(&mut self, delta: &ToolCallDelta) {
        if self.id.is_none() {
            if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
                self.id = Some(id.to_string());
            }
        }

        if let Some(call_type) = delta.call_type.as_deref().filter(|t| !t.is_empty()) {
            self.call_type = Some(call_type.to_string());
        }

        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty()) {
                self.name = name.to_string();
            }
            if let Some(arguments) = &function.arguments {
                self.arguments.push_str(arguments);
            }
        }
    }
}

/// The visible text and finalized invocations of one model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledResponse {
    pub content: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: Option<Usage>,
}

impl AssembledResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Incremental state machine over [`StreamChunk`]s.
#[derive(Debug, Default)]
pub struct DeltaAssembler {
    content: String,
    calls: BTreeMap<u32, Accumulator>,
    usage: Option<Usage>,
}

impl DeltaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the running state.
    pub fn push(&mut self, chunk: &StreamChunk) {
        if let Some(text) = &chunk.content {
            self.content.push_str(text);
        }

        for delta in &chunk.tool_calls {
            trace!(index = delta.index, "Tool call fragment");
            self.calls.entry(delta.index).or_default().apply(delta);
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }
    }

    /// Visible text received so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Number of indices seen so far, named or not.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Finalize in ascending index order. Accumulators that never
    /// received a name are dropped.
    pub fn finish(self) -> AssembledResponse {
        let mut tool_calls = Vec::with_capacity(self.calls.len());

        for (index, acc) in self.calls {
            if acc.name.is_empty() {
                debug!(index, "Dropping tool call fragment without a name");
                continue;
            }
            tool_calls.push(MessageToolCall {
                id: acc.id.unwrap_or_else(|| format!("call_{index}")),
                call_type: acc.call_type.unwrap_or_else(default_call_type),
                name: acc.name,
                arguments: acc.arguments,
            });
        }

        AssembledResponse {
            content: self.content,
            tool_calls,
            usage: self.usage,
        }
    }
}

/// Drain a chunk stream to completion, handing each visible text fragment
/// to `on_text` in arrival order. The next chunk is not read until the
/// returned future completes.
///
/// Stops at the first chunk flagged `done` or when the stream ends. A
/// provider error aborts assembly.
pub async fn assemble<S, F, Fut>(stream: S, mut on_text: F) -> Result<AssembledResponse, ProviderError>
where
    S: Stream<Item = Result<StreamChunk, ProviderError>>,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut assembler = DeltaAssembler::new();
    futures::pin_mut!(stream);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(text) = chunk.content.as_deref().filter(|t| !t.is_empty()) {
            on_text(text.to_string()).await;
        }
        assembler.push(&chunk);
        if chunk.done {
            break;
        }
    }

    Ok(assembler.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: u32) -> ToolCallDelta {
        ToolCallDelta::new(index)
    }

    #[test]
    fn fragments_for_one_index_concatenate() {
        let mut asm = DeltaAssembler::new();
        asm.push(&StreamChunk::deltas(vec![delta(0).with_id("c1").with_name("f")]));
        asm.push(&StreamChunk::deltas(vec![delta(0).with_arguments("{\"a\":")]));
        asm.push(&StreamChunk::deltas(vec![delta(0).with_arguments("1}")]));

        let response = asm.finish();
        assert_eq!(
            response.tool_calls,
            vec![MessageToolCall::new("c1", "f", "{\"a\":1}")]
        );
    }

    #[test]
    fn interleaved_indices_finalize_in_index_order() {
        let mut asm = DeltaAssembler::new();
        asm.push(&StreamChunk::deltas(vec![delta(1).with_id("c2").with_name("second")]));
        asm.push(&StreamChunk::deltas(vec![
            delta(0).with_id("c1").with_name("first"),
            delta(1).with_arguments("{\"y\":"),
        ]));
        asm.push(&StreamChunk::deltas(vec![delta(0).with_arguments("{}")]));
        asm.push(&StreamChunk::deltas(vec![delta(1).with_arguments("2}")]));

        let calls = asm.finish().tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[0].arguments, "{}");
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].arguments, "{\"y\":2}");
    }

    #[test]
    fn nameless_accumulator_is_dropped() {
        let mut asm = DeltaAssembler::new();
        asm.push(&StreamChunk::deltas(vec![delta(0).with_id("c1").with_arguments("{}")]));
        asm.push(&StreamChunk::deltas(vec![delta(1).with_id("c2").with_name("kept")]));
        assert_eq!(asm.pending_calls(), 2);

        let calls = asm.finish().tool_calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c2");
    }

    #[test]
    fn id_is_set_once_and_blank_name_does_not_clear() {
        let mut asm = DeltaAssembler::new();
        asm.push(&StreamChunk::deltas(vec![delta(0).with_id("first").with_name("tool")]));
        asm.push(&StreamChunk::deltas(vec![delta(0).with_id("second").with_name("")]));

        let call = &asm.finish().tool_calls[0];
        assert_eq!(call.id, "first");
        assert_eq!(call.name, "tool");
        assert_eq!(call.call_type, "function");
    }

    #[test]
    fn missing_id_falls_back_to_index() {
        let mut asm = DeltaAssembler::new();
        asm.push(&StreamChunk::deltas(vec![delta(3).with_name("t").with_type("function")]));
        assert_eq!(asm.finish().tool_calls[0].id, "call_3");
    }

    #[test]
    fn text_and_tool_calls_in_one_stream() {
        let mut asm = DeltaAssembler::new();
        asm.push(&StreamChunk::text("Let me "));
        asm.push(&StreamChunk {
            content: Some("check.".into()),
            tool_calls: vec![delta(0).with_id("c1").with_name("lookup")],
            ..StreamChunk::default()
        });
        assert_eq!(asm.content(), "Let me check.");

        let response = asm.finish();
        assert_eq!(response.content, "Let me check.");
        assert!(response.has_tool_calls());
    }

    #[tokio::test]
    async fn assemble_streams_text_and_stops_at_done() {
        let chunks = vec![
            Ok(StreamChunk::text("Hel")),
            Ok(StreamChunk::text("lo")),
            Ok(StreamChunk {
                done: true,
                usage: Some(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 2,
                    total_tokens: 5,
                }),
                ..StreamChunk::default()
            }),
            Ok(StreamChunk::text("ignored")),
        ];

        let mut seen = Vec::new();
        let response = assemble(futures::stream::iter(chunks), |t| {
            seen.push(t);
            std::future::ready(())
        })
            .await
            .unwrap();

        assert_eq!(seen, vec!["Hel", "lo"]);
        assert_eq!(response.content, "Hello");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[tokio::test]
    async fn assemble_propagates_stream_errors() {
        let chunks = vec![
            Ok(StreamChunk::text("partial")),
            Err(ProviderError::StreamInterrupted("reset".into())),
        ];
        let result = assemble(futures::stream::iter(chunks), |_| std::future::ready(())).await;
        assert!(matches!(result, Err(ProviderError::StreamInterrupted(_))));
    }
}
