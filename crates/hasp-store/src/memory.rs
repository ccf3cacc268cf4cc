// In-memory lease store
// Single-process stand-in for the shared store: every primitive holds one
// DashMap entry guard for its whole read-modify-write, so it is atomic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hasp_common::{QueueEntry, current_timestamp};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::store::{LeaseStore, StoreError, StoreResult};

struct LeaseEntry {
    token: String,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// member -> expiry
type CounterMembers = HashMap<String, Instant>;

fn live_count(members: &CounterMembers, now: Instant) -> i64 {
    members.values().filter(|expires_at| **expires_at > now).count() as i64
}

/// In-memory `LeaseStore` using DashMap
pub struct MemoryLeaseStore {
    leases: DashMap<String, LeaseEntry>,
    counters: DashMap<String, CounterMembers>,
    queues: DashMap<String, VecDeque<QueueEntry>>,
    hashes: DashMap<String, HashMap<String, String>>,
    events: broadcast::Sender<(String, String)>,
    available: AtomicBool,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            leases: DashMap::new(),
            counters: DashMap::new(),
            queues: DashMap::new(),
            hashes: DashMap::new(),
            events,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a store outage: while unavailable every operation fails
    /// with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        debug!(available, "Memory store availability changed");
    }

    /// Receive `(channel, message)` pairs passed to `publish`
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.events.subscribe()
    }

    /// Drop a lease as if its TTL had elapsed
    pub fn expire_now(&self, key: &str) -> bool {
        self.leases.remove(key).is_some()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let fresh = LeaseEntry {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    return Ok(false);
                }
                entry.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.is_live(now) && lease.token == token => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.is_live(now) && lease.token == token)
            .is_some())
    }

    async fn current_token(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .leases
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.token.clone()))
    }

    async fn force_delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .leases
            .remove(key)
            .is_some_and(|(_, lease)| lease.is_live(now)))
    }

    async fn increment_if_below(
        &self,
        key: &str,
        member: &str,
        max: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        self.check_available()?;
        let now = Instant::now();
        let mut members = self.counters.entry(key.to_string()).or_default();
        members.retain(|_, expires_at| *expires_at > now);

        if let Some(expires_at) = members.get_mut(member) {
            *expires_at = now + ttl;
            return Ok(Some(members.len() as i64));
        }
        if members.len() as i64 >= max {
            return Ok(None);
        }
        members.insert(member.to_string(), now + ttl);
        Ok(Some(members.len() as i64))
    }

    async fn extend_counter(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let extended = match self.counters.get_mut(key) {
            Some(mut members) => {
                members.retain(|_, expires_at| *expires_at > now);
                match members.get_mut(member) {
                    Some(expires_at) => {
                        *expires_at = now + ttl;
                        true
                    }
                    None => false,
                }
            }
            None => return Ok(false),
        };
        self.counters.remove_if(key, |_, members| members.is_empty());
        Ok(extended)
    }

    async fn decrement(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let removed = match self.counters.get_mut(key) {
            Some(mut members) => {
                let removed = members.remove(member).is_some_and(|expires_at| expires_at > now);
                members.retain(|_, expires_at| *expires_at > now);
                removed
            }
            None => return Ok(false),
        };
        self.counters.remove_if(key, |_, members| members.is_empty());
        Ok(removed)
    }

    async fn counter_value(&self, key: &str) -> StoreResult<i64> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .map(|members| live_count(&members, now))
            .unwrap_or(0))
    }

    async fn counter_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self.counters.get(key).is_some_and(|members| {
            members
                .get(member)
                .is_some_and(|expires_at| *expires_at > now)
        }))
    }

    async fn queue_push(&self, key: &str, entry: &QueueEntry) -> StoreResult<bool> {
        self.check_available()?;
        let mut queue = self.queues.entry(key.to_string()).or_default();

        if let Some(existing) = queue.iter_mut().find(|e| e.requester == entry.requester) {
            existing.deadline_ms = entry.deadline_ms;
            return Ok(false);
        }
        queue.push_back(entry.clone());
        Ok(true)
    }

    async fn queue_peek_head(&self, key: &str) -> StoreResult<Option<QueueEntry>> {
        self.check_available()?;
        let now_ms = current_timestamp();

        let head = match self.queues.get_mut(key) {
            Some(mut queue) => {
                while queue.front().is_some_and(|e| e.is_expired(now_ms)) {
                    if let Some(dropped) = queue.pop_front() {
                        debug!(
                            key = %key,
                            requester = %dropped.requester,
                            "Dropped expired queue entry"
                        );
                    }
                }
                queue.front().cloned()
            }
            None => return Ok(None),
        };

        if head.is_none() {
            self.queues.remove_if(key, |_, q| q.is_empty());
        }
        Ok(head)
    }

    async fn queue_remove(&self, key: &str, requester: &str) -> StoreResult<bool> {
        self.check_available()?;
        let removed = match self.queues.get_mut(key) {
            Some(mut queue) => {
                let before = queue.len();
                queue.retain(|e| e.requester != requester);
                queue.len() != before
            }
            None => false,
        };
        self.queues.remove_if(key, |_, q| q.is_empty());
        Ok(removed)
    }

    async fn queue_len(&self, key: &str) -> StoreResult<usize> {
        self.check_available()?;
        Ok(self.queues.get(key).map(|q| q.len()).unwrap_or(0))
    }

    async fn hash_put(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check_available()?;
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check_available()?;
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .hashes
            .get_mut(key)
            .map(|mut h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.check_available()?;
        // no subscribers is not an error
        let _ = self.events.send((channel.to_string(), message.to_string()));
        Ok(())
    }
}
