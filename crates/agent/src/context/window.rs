//! Bounded conversation window.
//!
//! Holds at most one system turn (always at index 0) followed by the
//! conversation. Every mutation recomputes a [`ContextSnapshot`], applies
//! the count and token policies, then notifies listeners in registration
//! order. Eviction removes the oldest non-system turns and always keeps
//! the most recent one.

use std::sync::Arc;

use rosiwit_config::ContextConfig;
use rosiwit_core::error::ContextError;
use rosiwit_core::event::{DomainEvent, EventBus};
use rosiwit_core::message::{Message, Role};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::token::{estimate_messages_bytes, estimate_messages_tokens};

/// Average tokens per evicted turn assumed by the token policy.
const TOKENS_PER_EVICTED_TURN: usize = 50;

/// Derived statistics, recomputed after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    /// All turns, system included
    pub message_count: usize,
    pub estimated_tokens: usize,
    /// Bytes of the JSON serialization
    pub estimated_size: usize,
    pub system_message_count: usize,
    pub user_message_count: usize,
    pub assistant_message_count: usize,
    pub tool_message_count: usize,
}

impl ContextSnapshot {
    fn compute(messages: &[Message]) -> Self {
        let count = |role: Role| messages.iter().filter(|m| m.role == role).count();
        Self {
            message_count: messages.len(),
            estimated_tokens: estimate_messages_tokens(messages),
            estimated_size: estimate_messages_bytes(messages),
            system_message_count: count(Role::System),
            user_message_count: count(Role::User),
            assistant_message_count: count(Role::Assistant),
            tool_message_count: count(Role::Tool),
        }
    }
}

/// Token returned by listener registration; pass it to
/// [`ContextWindow::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

pub type MessageListener = Box<dyn Fn(&[Message]) -> Result<(), String> + Send + Sync>;
pub type StatsListener = Box<dyn Fn(&ContextSnapshot) -> Result<(), String> + Send + Sync>;

pub struct ContextWindow {
    messages: Vec<Message>,
    max_messages: usize,
    max_tokens: usize,
    snapshot: ContextSnapshot,
    message_listeners: Vec<(u64, MessageListener)>,
    stats_listeners: Vec<(u64, StatsListener)>,
    next_listener: u64,
    events: Option<Arc<EventBus>>,
}

impl ContextWindow {
    pub fn new(max_messages: usize, max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(1),
            max_tokens,
            snapshot: ContextSnapshot::compute(&[]),
            message_listeners: Vec::new(),
            stats_listeners: Vec::new(),
            next_listener: 1,
            events: None,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.max_messages, config.max_tokens)
    }

    /// Publish `ContextEvicted` events on this bus.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn system_prompt(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    pub fn last_turn(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a turn. A system turn replaces the current one instead.
    pub fn add_turn(&mut self, message: Message) -> Result<(), ContextError> {
        if message.role == Role::System {
            if self.has_system() {
                self.messages[0] = message;
            } else {
                self.messages.insert(0, message);
            }
        } else {
            self.messages.push(message);
        }

        self.refresh();
        let evicted = self.enforce_limits();
        if evicted > 0 {
            self.refresh();
            self.publish_eviction(evicted);
        }
        self.notify()
    }

    /// Drop every turn except the system turn.
    pub fn clear(&mut self) -> Result<(), ContextError> {
        let keep = usize::from(self.has_system());
        self.messages.truncate(keep);
        self.refresh();
        self.notify()
    }

    /// Drop every turn, system included.
    pub fn clear_all(&mut self) -> Result<(), ContextError> {
        self.messages.clear();
        self.refresh();
        self.notify()
    }

    /// Register a callback receiving the full turn sequence after each change.
    pub fn on_messages(
        &mut self,
        listener: impl Fn(&[Message]) -> Result<(), String> + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id();
        self.message_listeners.push((id, Box::new(listener)));
        Subscription(id)
    }

    /// Register a callback receiving the fresh snapshot after each change.
    pub fn on_stats(
        &mut self,
        listener: impl Fn(&ContextSnapshot) -> Result<(), String> + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id();
        self.stats_listeners.push((id, Box::new(listener)));
        Subscription(id)
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.message_listeners.len() + self.stats_listeners.len();
        self.message_listeners.retain(|(id, _)| *id != subscription.0);
        self.stats_listeners.retain(|(id, _)| *id != subscription.0);
        before != self.message_listeners.len() + self.stats_listeners.len()
    }

    /// Human-readable report of the current window, also logged at info.
    pub fn summary(&self) -> String {
        let s = &self.snapshot;
        let report = format!(
            "Context: {} messages ({} user, {} assistant, {} tool), ~{}/{} tokens, {} bytes",
            s.message_count,
            s.user_message_count,
            s.assistant_message_count,
            s.tool_message_count,
            s.estimated_tokens,
            self.max_tokens,
            s.estimated_size,
        );
        info!(
            messages = s.message_count,
            tokens = s.estimated_tokens,
            bytes = s.estimated_size,
            "{report}"
        );
        report
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_listener;
        self.next_listener += 1;
        id
    }

    fn has_system(&self) -> bool {
        self.system_prompt().is_some()
    }

    fn non_system_count(&self) -> usize {
        self.messages.len() - usize::from(self.has_system())
    }

    fn refresh(&mut self) {
        self.snapshot = ContextSnapshot::compute(&self.messages);
    }

    /// Apply the count policy, then the token policy. Returns how many
    /// turns were removed.
    fn enforce_limits(&mut self) -> usize {
        let mut evicted = 0;

        let non_system = self.non_system_count();
        if non_system > self.max_messages {
            evicted += self.evict_oldest(non_system - self.max_messages);
        }

        if estimate_messages_tokens(&self.messages) > self.max_tokens {
            let target = self.max_tokens * 4 / 5;
            loop {
                let tokens = estimate_messages_tokens(&self.messages);
                if tokens <= target {
                    break;
                }
                let removed = self.evict_oldest((tokens - target).div_ceil(TOKENS_PER_EVICTED_TURN));
                if removed == 0 {
                    break;
                }
                evicted += removed;
            }
        }

        evicted
    }

    /// Remove up to `count` of the oldest non-system turns, never the last
    /// one. Tool results orphaned at the front go with their request.
    fn evict_oldest(&mut self, count: usize) -> usize {
        let start = usize::from(self.has_system());
        let mut removable = count.min(self.non_system_count().saturating_sub(1));
        if removable == 0 {
            return 0;
        }

        while start + removable < self.messages.len() - 1
            && self.messages[start + removable].role == Role::Tool
        {
            removable += 1;
        }

        self.messages.drain(start..start + removable);
        removable
    }

    fn publish_eviction(&self, evicted: usize) {
        debug!(
            evicted,
            remaining = self.snapshot.message_count,
            tokens = self.snapshot.estimated_tokens,
            "Evicted oldest turns"
        );
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ContextEvicted {
                evicted,
                remaining: self.snapshot.message_count,
                estimated_tokens: self.snapshot.estimated_tokens,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Call message listeners then stats listeners. The first failure ends
    /// the pass.
    fn notify(&self) -> Result<(), ContextError> {
        for (id, listener) in &self.message_listeners {
            listener(&self.messages).map_err(|reason| self.listener_failed(*id, reason))?;
        }
        for (id, listener) in &self.stats_listeners {
            listener(&self.snapshot).map_err(|reason| self.listener_failed(*id, reason))?;
        }
        Ok(())
    }

    fn listener_failed(&self, listener: u64, reason: String) -> ContextError {
        warn!(listener, reason = %reason, "Context listener failed");
        ContextError::Listener { listener, reason }
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl std::fmt::Debug for ContextWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWindow")
            .field("messages", &self.messages.len())
            .field("max_messages", &self.max_messages)
            .field("max_tokens", &self.max_tokens)
            .field("listeners", &(self.message_listeners.len() + self.stats_listeners.len()))
            .finish()
    }
}
