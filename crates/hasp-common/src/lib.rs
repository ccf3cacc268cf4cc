//! Hasp Common - Shared types, errors, and configuration
//!
//! This crate provides the foundational types used across all hasp components:
//! - Error taxonomy (`LockError`)
//! - Lock identity model (lock types, keys, tokens, waiter identities)
//! - Store key space rendering
//! - Engine configuration
//! - Time and backoff helpers

pub mod config;
pub mod error;
pub mod keys;
pub mod model;
pub mod utils;

// Re-exports for convenience
pub use config::LockConfig;
pub use error::{LockError, Result};
pub use keys::KeySpace;
pub use model::{LockKey, LockToken, LockType, QueueEntry, WaiterId};
pub use utils::{Backoff, current_timestamp};

/// Default store key prefix used when no namespace is configured
pub const DEFAULT_NAMESPACE: &str = "hasp";
