//! Error taxonomy for the lock engine
//!
//! Every public lock operation returns one of these conditions. Raw store
//! client errors never reach callers: the store adapter translates them into
//! `StoreUnavailable` / `LockUnavailable` at its boundary.

use crate::model::WaiterId;

/// Lock engine error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Transient store outage, retried with backoff before being surfaced
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store retries for a lock operation were exhausted
    #[error("lock '{key}' unavailable after {attempts} attempts: {reason}")]
    LockUnavailable {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("timed out after {waited_ms}ms waiting for lock '{key}'")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Unlock or renew presented a token that no longer owns the lease
    #[error("token mismatch on lock '{key}'")]
    LockTokenMismatch { key: String },

    #[error("deadlock detected on lock '{key}': cycle [{}]", format_cycle(.cycle))]
    DeadlockDetected { key: String, cycle: Vec<WaiterId> },

    /// A fair-queue entry could not be removed on timeout cleanup
    #[error("queue entry of '{requester}' on '{key}' abandoned: {reason}")]
    QueueAbandoned {
        key: String,
        requester: String,
        reason: String,
    },

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("lock manager is shut down")]
    ShutDown,
}

impl LockError {
    /// Whether the condition is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::StoreUnavailable(_) | LockError::LockUnavailable { .. }
        )
    }

    /// Cycle participants when this is a deadlock condition
    pub fn deadlock_cycle(&self) -> Option<&[WaiterId]> {
        match self {
            LockError::DeadlockDetected { cycle, .. } => Some(cycle),
            _ => None,
        }
    }
}

fn format_cycle(cycle: &[WaiterId]) -> String {
    cycle
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<serde_json::Error> for LockError {
    fn from(value: serde_json::Error) -> Self {
        LockError::Serialization(value.to_string())
    }
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_message_names_participants() {
        let err = LockError::DeadlockDetected {
            key: "hasp:lock:order:42".to_string(),
            cycle: vec![WaiterId::new("n1", "a"), WaiterId::new("n1", "b")],
        };

        let msg = err.to_string();
        assert!(msg.contains("n1/a -> n1/b"));
        assert_eq!(err.deadlock_cycle().map(|c| c.len()), Some(2));
    }

    #[test]
    fn test_retryable_conditions() {
        assert!(LockError::StoreUnavailable("down".into()).is_retryable());
        assert!(
            !LockError::LockTimeout {
                key: "k".into(),
                waited_ms: 10
            }
            .is_retryable()
        );
        assert!(!LockError::ShutDown.is_retryable());
    }
}
