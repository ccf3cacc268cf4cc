//! Store key space
//!
//! Store entries per resource, all under the operator-configured namespace
//! prefix. Exclusive and fair locks on a resource share one lease, so the
//! two kinds exclude each other.

use crate::model::{LockKey, LockType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Primary lease key for a lock of the given type
    pub fn lease_key(&self, lock_type: LockType, key: &LockKey) -> String {
        match lock_type {
            LockType::Exclusive | LockType::Fair => self.exclusive(key),
            LockType::Read => self.readers(key),
            LockType::Write => self.writer(key),
        }
    }

    /// Resource name used in wait-for graphs.
    ///
    /// Both sides of a read-write lock share one graph resource so a writer
    /// waiting on readers (and readers waiting on a writer) form edges.
    pub fn graph_key(&self, lock_type: LockType, key: &LockKey) -> String {
        match lock_type {
            LockType::Exclusive | LockType::Fair => self.exclusive(key),
            LockType::Read | LockType::Write => self.rw(key),
        }
    }

    pub fn exclusive(&self, key: &LockKey) -> String {
        format!(
            "{}:lock:{}:{}",
            self.prefix, key.resource_class, key.resource_id
        )
    }

    pub fn rw(&self, key: &LockKey) -> String {
        format!("{}:rw:{}:{}", self.prefix, key.resource_class, key.resource_id)
    }

    pub fn readers(&self, key: &LockKey) -> String {
        format!("{}:readers", self.rw(key))
    }

    pub fn writer(&self, key: &LockKey) -> String {
        format!("{}:writer", self.rw(key))
    }

    pub fn writer_waiting(&self, key: &LockKey) -> String {
        format!("{}:writer-waiting", self.rw(key))
    }

    pub fn fair_queue(&self, key: &LockKey) -> String {
        format!(
            "{}:fair:{}:{}:queue",
            self.prefix, key.resource_class, key.resource_id
        )
    }

    pub fn detector_heartbeats(&self) -> String {
        format!("{}:detector:heartbeat", self.prefix)
    }

    pub fn detector_graph(&self) -> String {
        format!("{}:detector:graph", self.prefix)
    }

    /// Hash of victims chosen by the coordinator, keyed by rendered waiter id
    pub fn detector_victims(&self) -> String {
        format!("{}:detector:victims", self.prefix)
    }

    pub fn recovery_channel(&self) -> String {
        format!("{}:detector:recovered", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(crate::DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_keys_per_type() {
        let ks = KeySpace::new("app");
        let key = LockKey::new("order", "42").unwrap();

        let keys: std::collections::HashSet<String> = LockType::ALL
            .iter()
            .map(|t| ks.lease_key(*t, &key))
            .collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(ks.exclusive(&key), "app:lock:order:42");
        assert_eq!(ks.lease_key(LockType::Fair, &key), ks.exclusive(&key));
        assert_eq!(ks.graph_key(LockType::Fair, &key), ks.exclusive(&key));
        assert_eq!(ks.fair_queue(&key), "app:fair:order:42:queue");
        assert_eq!(
            ks.graph_key(LockType::Read, &key),
            ks.graph_key(LockType::Write, &key)
        );
    }
}
