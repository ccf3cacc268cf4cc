// Reentrancy bookkeeping
// One entry per (client, lock type, resource) held through this engine.
// Nested acquisitions only bump the count; the store sees the outermost
// acquire and the outermost release.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hasp_common::{LockKey, LockToken, LockType, WaiterId};
use tokio::time::Instant;

use crate::watchdog::Watchdog;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HoldKey {
    pub holder: WaiterId,
    pub lock_type: LockType,
    pub resource: LockKey,
}

impl HoldKey {
    pub fn new(holder: &WaiterId, lock_type: LockType, resource: &LockKey) -> Self {
        Self {
            holder: holder.clone(),
            lock_type,
            resource: resource.clone(),
        }
    }
}

pub struct Hold {
    pub token: LockToken,
    pub count: u32,
    pub ttl: Duration,
    pub acquired_at: Instant,
    watchdog: Option<Watchdog>,
}

impl Hold {
    pub fn new(token: LockToken, ttl: Duration, watchdog: Option<Watchdog>) -> Self {
        Self {
            token,
            count: 1,
            ttl,
            acquired_at: Instant::now(),
            watchdog,
        }
    }

    pub fn has_watchdog(&self) -> bool {
        self.watchdog.is_some()
    }

    pub fn stop_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
    }
}

/// Outcome of one unlock against the table
pub enum Exit {
    /// No entry: the lease was not taken through this engine (or already left it)
    NotHeld,
    TokenMismatch,
    /// Still held, with this many acquisitions left
    Nested(u32),
    /// Outermost unlock; the caller releases the store lease
    Released(Hold),
}

#[derive(Default)]
pub struct HoldTable {
    holds: DashMap<HoldKey, Hold>,
}

impl HoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the count of an existing hold and return its token
    pub fn reenter(&self, key: &HoldKey) -> Option<LockToken> {
        self.holds.get_mut(key).map(|mut hold| {
            hold.count += 1;
            hold.token.clone()
        })
    }

    pub fn insert(&self, key: HoldKey, hold: Hold) {
        self.holds.insert(key, hold);
    }

    pub fn exit(&self, key: &HoldKey, token: &LockToken) -> Exit {
        match self.holds.entry(key.clone()) {
            Entry::Vacant(_) => Exit::NotHeld,
            Entry::Occupied(mut entry) => {
                if entry.get().token != *token {
                    return Exit::TokenMismatch;
                }
                if entry.get().count > 1 {
                    let hold = entry.get_mut();
                    hold.count -= 1;
                    return Exit::Nested(hold.count);
                }
                Exit::Released(entry.remove())
            }
        }
    }

    pub fn token_of(&self, key: &HoldKey) -> Option<LockToken> {
        self.holds.get(key).map(|hold| hold.token.clone())
    }

    pub fn count_of(&self, key: &HoldKey) -> u32 {
        self.holds.get(key).map(|hold| hold.count).unwrap_or(0)
    }

    /// Drop the entry if it still carries `token`
    pub fn remove_if_token(&self, key: &HoldKey, token: &LockToken) -> Option<Hold> {
        self.holds
            .remove_if(key, |_, hold| hold.token == *token)
            .map(|(_, hold)| hold)
    }

    /// (key, token) of every hold, for validation passes
    pub fn entries(&self) -> Vec<(HoldKey, LockToken)> {
        self.holds
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().token.clone()))
            .collect()
    }

    pub fn drain(&self) -> Vec<(HoldKey, Hold)> {
        let keys: Vec<HoldKey> = self.holds.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.holds.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }
}
