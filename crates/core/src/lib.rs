//! # Rosiwit Core
//!
//! Domain types, traits, and error definitions for the Rosiwit agent runtime.
//! This crate has **no transport dependencies** - it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every seam is defined here. Implementations live in their
//! respective crates:
//! - `rosiwit-mcp` talks to tool servers and produces [`ToolResult`]s
//! - `rosiwit-providers` implements [`Provider`]
//! - `rosiwit-agent` assembles [`StreamChunk`]s and owns the context window

pub mod error;
pub mod event;
pub mod lines;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ContextError, Error, McpError, ProviderError, Result};
pub use event::{DomainEvent, EventBus};
pub use lines::LineBuffer;
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, FunctionDelta, FunctionTool, Provider, ProviderRequest, StreamChunk,
    ToolCallDelta, ToolDefinition, Usage,
};
pub use tool::{ToolCall, ToolDescriptor, ToolResult};
