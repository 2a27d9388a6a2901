//! Event types delivered through the hub
//!
//! An event is an opaque payload plus a delivery-scope descriptor. Events are
//! created by producers (post handlers, presence tracking, preference
//! updates), fanned out once per matching connection, and never persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::current_timestamp;

/// Unique identifier types
pub type UserId = String;
pub type ChannelId = String;
pub type TeamId = String;
pub type ConnectionId = String;

/// The kind of state change an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new message was posted
    Posted,
    /// An existing message was edited
    PostEdited,
    /// A message was deleted
    PostDeleted,
    /// A user's presence status changed
    StatusChange,
    /// A user preference changed
    PreferenceChanged,
    /// A user started or stopped typing
    Typing,
    /// A user viewed a channel (read marker moved)
    ChannelViewed,
    /// Server greeting sent to a freshly registered connection
    Hello,
}

impl EventKind {
    /// Stable string name, used for metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Posted => "posted",
            EventKind::PostEdited => "post_edited",
            EventKind::PostDeleted => "post_deleted",
            EventKind::StatusChange => "status_change",
            EventKind::PreferenceChanged => "preference_changed",
            EventKind::Typing => "typing",
            EventKind::ChannelViewed => "channel_viewed",
            EventKind::Hello => "hello",
        }
    }
}

/// Delivery scope: which connections an event is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Every connection
    All,
    /// All connections belonging to one user
    User(UserId),
    /// All connections subscribed to one channel
    Channel(ChannelId),
    /// All connections belonging to members of one team
    Team(TeamId),
}

/// One event flowing through the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened
    pub kind: EventKind,
    /// Who should receive it
    pub scope: EventScope,
    /// Opaque payload, interpreted by clients only
    pub payload: Value,
    /// Creation timestamp in milliseconds since UNIX epoch
    pub created_at: u64,
}

impl Event {
    /// Create a new event with an empty payload
    pub fn new(kind: EventKind, scope: EventScope) -> Self {
        Self {
            kind,
            scope,
            payload: Value::Null,
            created_at: current_timestamp(),
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
