use serde::{Deserialize, Serialize};

use crate::model::message::Message;

/// The remote service's documented cap on messages per media group.
pub const MEDIA_GROUP_CAP: usize = 10;

/// An ordered non-empty sequence of [`Message`]s sharing the same non-empty
/// `group_id`. Once constructed, a `MediaGroup` is never split by any
/// downstream component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaGroup {
    pub group_id: String,
    pub messages: Vec<Message>,
}

impl MediaGroup {
    /// Build a group from a non-empty slice of messages sharing `group_id`.
    /// Panics if `messages` is empty — callers (the Grouper) never produce
    /// an empty group.
    pub fn new(group_id: String, messages: Vec<Message>) -> Self {
        assert!(!messages.is_empty(), "MediaGroup must be non-empty");
        Self { group_id, messages }
    }

    pub fn weight(&self) -> u64 {
        self.messages.iter().map(Message::weight).sum()
    }

    /// The group's source ordering key: the id of its first (earliest)
    /// constituent message.
    pub fn source_id(&self) -> i64 {
        self.messages[0].message_id
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Tagged sum of either one standalone message or an indivisible group —
/// the granularity every downstream component operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AtomicUnit {
    Singleton(Message),
    Group(MediaGroup),
}

impl AtomicUnit {
    pub fn weight(&self) -> u64 {
        match self {
            AtomicUnit::Singleton(m) => m.weight(),
            AtomicUnit::Group(g) => g.weight(),
        }
    }

    /// The unit's position in source order, used for ordering guarantees.
    pub fn source_id(&self) -> i64 {
        match self {
            AtomicUnit::Singleton(m) => m.message_id,
            AtomicUnit::Group(g) => g.source_id(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        match self {
            AtomicUnit::Singleton(m) => std::slice::from_ref(m),
            AtomicUnit::Group(g) => &g.messages,
        }
    }

    pub fn message_count(&self) -> usize {
        match self {
            AtomicUnit::Singleton(_) => 1,
            AtomicUnit::Group(g) => g.len(),
        }
    }
}
