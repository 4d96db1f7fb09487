//! Bounded conversation context.
//!
//! | Policy | Trigger | Action |
//! |--------|---------|--------|
//! | Count | more than `max_messages` non-system turns | drop oldest down to the limit |
//! | Tokens | estimate above `max_tokens` | drop oldest until at 80% of the budget |
//!
//! The system turn is never evicted and the most recent turn always stays.

pub mod token;
pub mod window;

pub use window::{ContextSnapshot, ContextWindow, MessageListener, StatsListener, Subscription};
