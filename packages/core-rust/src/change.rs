//! Row changes emitted by the local store and events delivered by the
//! remote change stream.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::types::{Key, Row};

/// The atomic unit emitted by the local store on every mutation.
///
/// `old` absent means insert; `new` absent means delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub key: Key,
    pub old: Option<Row>,
    pub new: Option<Row>,
}

impl Change {
    #[must_use]
    pub fn kind(&self) -> EventType {
        match (&self.old, &self.new) {
            (None, _) => EventType::Insert,
            (Some(_), Some(_)) => EventType::Update,
            (Some(_), None) => EventType::Delete,
        }
    }
}

/// Kind of a remote change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// One notification from the shared change channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub commit_timestamp: Timestamp,
    pub table: String,
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
}

impl ChangeEvent {
    #[must_use]
    pub fn insert(table: impl Into<String>, at: Timestamp, row: Row) -> Self {
        Self {
            commit_timestamp: at,
            table: table.into(),
            event_type: EventType::Insert,
            new: Some(row),
            old: None,
        }
    }

    #[must_use]
    pub fn update(table: impl Into<String>, at: Timestamp, row: Row) -> Self {
        Self {
            commit_timestamp: at,
            table: table.into(),
            event_type: EventType::Update,
            new: Some(row),
            old: None,
        }
    }

    /// A delete event; `old` carries at least the primary key.
    #[must_use]
    pub fn delete(table: impl Into<String>, at: Timestamp, old: Row) -> Self {
        Self {
            commit_timestamp: at,
            table: table.into(),
            event_type: EventType::Delete,
            new: None,
            old: Some(old),
        }
    }
}
