//! Bounded per-session memory handed to the backend for continuity.
//!
//! Nothing here is persisted: a [`SessionContext`] and a
//! [`ConversationHistory`] live exactly as long as the session that owns them.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SESSION_CONTEXT_CAPACITY: usize = 10;
pub const HISTORY_CAPACITY: usize = 20;

/// Fixed-capacity FIFO. Pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// One resolved tool call, as remembered for the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    pub payload: Value,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    calls: Ring<ToolInvocation>,
    turn_count: u64,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::with_capacity(SESSION_CONTEXT_CAPACITY)
    }
}

impl SessionContext {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            calls: Ring::new(capacity),
            turn_count: 0,
        }
    }

    pub fn record(&mut self, invocation: ToolInvocation) {
        self.calls.push(invocation);
    }

    pub fn next_turn(&mut self) -> u64 {
        self.turn_count += 1;
        self.turn_count
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn calls(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.calls.iter()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// The JSON shape sent as `sessionContext` in orchestrator requests.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "recentToolCalls": self.calls.iter().collect::<Vec<_>>(),
            "turnCount": self.turn_count,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub is_user: bool,
    pub text: String,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            is_user: true,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            is_user: false,
            text: text.into(),
        }
    }
}

/// Short local context for the backend. The UI keeps its own full copy.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: Ring<HistoryEntry>,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self {
            entries: Ring::new(HISTORY_CAPACITY),
        }
    }
}

impl ConversationHistory {
    pub fn push(&mut self, entry: HistoryEntry) {
        if entry.text.trim().is_empty() {
            return;
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
