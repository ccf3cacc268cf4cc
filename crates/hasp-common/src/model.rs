//! Lock identity model
//!
//! Identities are plain strings and ordered structs rather than live task
//! handles, so the wait-for graphs can be built from synthetic data in tests.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Lock type selected by the manager façade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Reentrant mutual-exclusion lease
    Exclusive,
    /// Shared read side of a read-write lock
    Read,
    /// Exclusive write side of a read-write lock
    Write,
    /// FIFO-ordered exclusive lock
    Fair,
}

impl LockType {
    pub const ALL: [LockType; 4] = [
        LockType::Exclusive,
        LockType::Read,
        LockType::Write,
        LockType::Fair,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Exclusive => "exclusive",
            LockType::Read => "read",
            LockType::Write => "write",
            LockType::Fair => "fair",
        }
    }
}

impl Display for LockType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" | "mutex" => Ok(LockType::Exclusive),
            "read" => Ok(LockType::Read),
            "write" => Ok(LockType::Write),
            "fair" => Ok(LockType::Fair),
            _ => Err(format!("Invalid lock type: {}", s)),
        }
    }
}

/// Caller-supplied `(resource-class, resource-id)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub resource_class: String,
    pub resource_id: String,
}

impl LockKey {
    /// Create a validated lock key.
    ///
    /// Both parts must be non-empty and free of the `:` key separator.
    pub fn new(
        resource_class: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Result<Self, LockError> {
        let resource_class = resource_class.into();
        let resource_id = resource_id.into();
        validate_part("resource class", &resource_class)?;
        validate_part("resource id", &resource_id)?;
        Ok(Self {
            resource_class,
            resource_id,
        })
    }
}

fn validate_part(what: &str, value: &str) -> Result<(), LockError> {
    if value.is_empty() {
        return Err(LockError::IllegalArgument(format!("{} must not be empty", what)));
    }
    if value.contains(':') {
        return Err(LockError::IllegalArgument(format!(
            "{} '{}' must not contain ':'",
            what, value
        )));
    }
    Ok(())
}

impl Display for LockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_class, self.resource_id)
    }
}

/// Opaque, unguessable lease token issued at acquisition time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LockToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a lock client: the node (process) it lives on plus a
/// client id unique within that node.
///
/// The derived ordering (node id, then client id) is the total order used
/// for deadlock victim selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaiterId {
    pub node_id: String,
    pub client_id: String,
}

impl WaiterId {
    pub fn new(node_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl Display for WaiterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node_id, self.client_id)
    }
}

/// Fair-queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Requester identity (rendered `WaiterId`)
    pub requester: String,
    /// Enqueue time (Unix millis)
    pub enqueued_at_ms: i64,
    /// Past this instant (Unix millis) the entry is considered abandoned
    pub deadline_ms: i64,
}

impl QueueEntry {
    pub fn new(requester: impl Into<String>, enqueued_at_ms: i64, deadline_ms: i64) -> Self {
        Self {
            requester: requester.into(),
            enqueued_at_ms,
            deadline_ms,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.deadline_ms
    }
}
