//! Shared types for blockbridge
//!
//! This crate provides the identifiers and small enums used across the
//! blockbridge crates: block ids, queue statuses, change kinds and the
//! variable types runtime blocks declare.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable local block identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of the `index`-th child of this block.
    pub fn child(&self, index: usize) -> Self {
        Self(format!("{}.{}", self.0, index))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(id: &str) -> Self {
        BlockId(id.to_string())
    }
}

impl From<String> for BlockId {
    fn from(id: String) -> Self {
        BlockId(id)
    }
}

/// Kind of change carried by a sync queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Some(ChangeType::Insert),
            "update" => Some(ChangeType::Update),
            "delete" => Some(ChangeType::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "insert",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// Lifecycle status of a sync queue entry
///
/// `pending -> processing -> {success, error, conflict}`; `conflict` goes back
/// to `processing` once resolved, `error` back to `pending` only on requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Success,
    Error,
    Conflict,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Success,
        QueueStatus::Error,
        QueueStatus::Conflict,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "success" => Some(QueueStatus::Success),
            "error" => Some(QueueStatus::Error),
            "conflict" => Some(QueueStatus::Conflict),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Success => "success",
            QueueStatus::Error => "error",
            QueueStatus::Conflict => "conflict",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Success | QueueStatus::Error)
    }

    /// Whether `self -> next` is a legal queue transition.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Success)
                | (Processing, Error)
                | (Processing, Conflict)
                | (Conflict, Processing)
                | (Error, Pending)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side a change travels to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    ToRemote,
    FromRemote,
}

impl SyncDirection {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "to_remote" => Some(SyncDirection::ToRemote),
            "from_remote" => Some(SyncDirection::FromRemote),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::ToRemote => "to_remote",
            SyncDirection::FromRemote => "from_remote",
        }
    }
}

/// Type of a runtime variable declared by a `state`, `set` or `form` block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl VarType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "string" => Some(VarType::String),
            "number" => Some(VarType::Number),
            "boolean" => Some(VarType::Boolean),
            "object" => Some(VarType::Object),
            "array" => Some(VarType::Array),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VarType::String => "string",
            VarType::Number => "number",
            VarType::Boolean => "boolean",
            VarType::Object => "object",
            VarType::Array => "array",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_transitions() {
        use QueueStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Conflict));
        assert!(Conflict.can_transition_to(Processing));
        assert!(Error.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Processing));
        assert!(!Conflict.can_transition_to(Success));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in QueueStatus::ALL {
            assert_eq!(QueueStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::from_str("done"), None);
    }

    #[test]
    fn test_child_ids() {
        let id = BlockId::new("abc");
        assert_eq!(id.child(2).as_str(), "abc.2");
    }
}
