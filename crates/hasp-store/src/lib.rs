//! Hasp Store - Lease store adapters
//!
//! This crate provides:
//! - The `LeaseStore` trait: the atomic primitives the lock engine needs
//!   from the shared coordination store
//! - `MemoryLeaseStore`: in-process implementation for tests and single-node use
//! - `RedisLeaseStore`: Redis implementation (feature `redis-store`)
//! - Bounded retry with backoff that turns store outages into `LockUnavailable`

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;
mod retry;
mod store;

pub use memory::MemoryLeaseStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisLeaseStore;
pub use retry::{RetryPolicy, RetryingStore, with_retry};
pub use store::{LeaseStore, StoreError, StoreResult};
