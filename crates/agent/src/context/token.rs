//! Token and size estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token, rounded up
//! over the whole window rather than per message.

use rosiwit_core::message::Message;
use rosiwit_core::provider::FunctionTool;

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate tokens for a slice of messages: total content characters / 4,
/// rounded up.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    let chars: usize = messages.iter().map(Message::content_chars).sum();
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Size in bytes of the messages serialized as JSON.
pub fn estimate_messages_bytes(messages: &[Message]) -> usize {
    serde_json::to_vec(messages).map(|v| v.len()).unwrap_or(0)
}

/// Estimate tokens for a tool catalog (serialized as JSON).
pub fn estimate_tools_tokens(tools: &[FunctionTool]) -> usize {
    let json = serde_json::to_string(tools).unwrap_or_default();
    estimate_tokens(&json)
}
