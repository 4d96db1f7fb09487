//! The agent side of Rosiwit.
//!
//! A request follows a **stream → assemble → execute** cycle:
//!
//! 1. **Send** the context window and MCP tool catalog to the provider
//! 2. **Assemble** streamed text and tool-call fragments into invocations
//! 3. **If tool calls**: run them through the registry, append one `tool`
//!    turn each, loop back to step 1
//! 4. **If text only**: append the answer and return
//!
//! The loop also stops once the iteration limit is reached.

pub mod assembler;
pub mod context;
pub mod identity;
pub mod loop_runner;
pub mod stream_event;

pub use assembler::{AssembledResponse, DeltaAssembler, assemble};
pub use context::{ContextSnapshot, ContextWindow, Subscription};
pub use identity::{PromptSources, SystemPrompt};
pub use loop_runner::{AgentLoop, AgentResponse};
pub use stream_event::AgentStreamEvent;
