//! Queue item types and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Priority
// ============================================================================

/// Insertion priority for queue items.
///
/// High items go ahead of Normal items but behind other High items, so
/// ordering stays FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Appended at the tail.
    #[default]
    Normal,
    /// Inserted ahead of all Normal items.
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

// ============================================================================
// Item Kind
// ============================================================================

/// What sort of work an item represents.
///
/// Dispatch on this is an explicit match, never a string lookup on the
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// An agent response to relay.
    #[default]
    Message,
    /// An instruction for the worker itself.
    Command,
    /// A notification with no reply expected.
    Event,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Message => write!(f, "message"),
            ItemKind::Command => write!(f, "command"),
            ItemKind::Event => write!(f, "event"),
        }
    }
}

// ============================================================================
// Item State
// ============================================================================

/// Lifecycle state of a queue item.
///
/// # State Transitions
///
/// - `Pending` -> `Sent` | `Failed`
/// - `Sent` -> `Read` | `Failed`
///
/// `Read` and `Failed` are terminal; the item is archived afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ItemState {
    /// Waiting to be handed to a handler.
    #[default]
    Pending,
    /// Handed to a handler; outcome unknown.
    Sent,
    /// Handled successfully.
    Read,
    /// Permanently failed.
    Failed,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Pending => write!(f, "pending"),
            ItemState::Sent => write!(f, "sent"),
            ItemState::Read => write!(f, "read"),
            ItemState::Failed => write!(f, "failed"),
        }
    }
}

impl ItemState {
    /// Check if this state can transition to the target state.
    #[must_use]
    pub fn can_transition_to(&self, target: ItemState) -> bool {
        use ItemState::{Failed, Pending, Read, Sent};
        matches!((self, target), (Pending, Sent | Failed) | (Sent, Read | Failed))
    }

    /// Whether the item still awaits processing (survives crash recovery
    /// back into the in-memory ordering).
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ItemState::Pending | ItemState::Sent)
    }
}

// ============================================================================
// Queue Item
// ============================================================================

/// A unit of work owned exclusively by the [`PersistentQueue`](super::PersistentQueue).
///
/// Created on enqueue and mutated only through the queue's
/// state-transition API until it is archived or swept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item id.
    pub id: String,
    /// Owner namespace (worker identity).
    pub owner_id: String,
    /// Opaque payload; the core never inspects it.
    pub payload: serde_json::Value,
    /// Work kind, driving handler dispatch.
    #[serde(default)]
    pub kind: ItemKind,
    /// Insertion priority.
    pub priority: Priority,
    /// Lifecycle state.
    pub state: ItemState,
    /// When the item was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the item was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a fresh pending item with a v4 uuid.
    pub fn new(owner_id: impl Into<String>, payload: serde_json::Value, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            payload,
            kind: ItemKind::Message,
            priority,
            state: ItemState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the work kind.
    #[must_use]
    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }
}
