//! Wait-for graph
//!
//! Identities are `WaiterId` values and resources are graph keys (strings),
//! so the same structure serves the per-process detector and the merged
//! cluster-wide graph, and can be built from synthetic data in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use hasp_common::{LockKey, LockType, WaiterId};
use serde::{Deserialize, Serialize};

/// A waiter blocked on a graph resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter: WaiterId,
    pub lock_key: String,
    pub lock_type: LockType,
    /// First time this wait was registered (Unix millis)
    pub since_ms: i64,
    /// A writer under writer priority: while it waits, new readers of the
    /// same resource are turned away as if it already held the lock
    #[serde(default)]
    pub blocks_readers: bool,
}

/// A lease held on a graph resource
///
/// Carries enough to release the lease through the store (lock type,
/// resource and token), which the distributed detector needs to recover a
/// victim that lives on another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLease {
    pub holder: WaiterId,
    pub lock_key: String,
    pub lock_type: LockType,
    pub resource: LockKey,
    pub token: String,
}

/// Whether a wait of `waiting` type is blocked by a hold of `held` type.
/// Only shared reads are compatible with each other.
pub fn conflicts(waiting: LockType, held: LockType) -> bool {
    !(waiting == LockType::Read && held == LockType::Read)
}

/// Rotate a cycle so its smallest participant comes first
pub fn canonicalize(mut cycle: Vec<WaiterId>) -> Vec<WaiterId> {
    if let Some(pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(pos);
    }
    cycle
}

/// Deterministic victim: the lowest `(node_id, client_id)` in the cycle
pub fn select_victim(cycle: &[WaiterId]) -> Option<&WaiterId> {
    cycle.iter().min()
}

#[derive(Debug, Clone, Default)]
pub struct WaitForGraph {
    /// waiter -> graph key -> edge
    waits: BTreeMap<WaiterId, BTreeMap<String, WaitEdge>>,
    /// graph key -> holder -> lease
    holders: BTreeMap<String, BTreeMap<WaiterId, HeldLease>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from exported edges and leases
    pub fn from_parts(
        waits: impl IntoIterator<Item = WaitEdge>,
        holds: impl IntoIterator<Item = HeldLease>,
    ) -> Self {
        let mut graph = Self::new();
        graph.merge(waits, holds);
        graph
    }

    pub fn merge(
        &mut self,
        waits: impl IntoIterator<Item = WaitEdge>,
        holds: impl IntoIterator<Item = HeldLease>,
    ) {
        for edge in waits {
            self.add_wait(edge);
        }
        for lease in holds {
            self.add_hold(lease);
        }
    }

    /// Insert or refresh a wait edge. Returns true when the edge is new.
    ///
    /// A refresh keeps the original `since_ms`.
    pub fn add_wait(&mut self, edge: WaitEdge) -> bool {
        let edges = self.waits.entry(edge.waiter.clone()).or_default();
        match edges.get_mut(&edge.lock_key) {
            Some(existing) => {
                existing.lock_type = edge.lock_type;
                existing.blocks_readers = edge.blocks_readers;
                false
            }
            None => {
                edges.insert(edge.lock_key.clone(), edge);
                true
            }
        }
    }

    pub fn remove_wait(&mut self, waiter: &WaiterId, lock_key: &str) -> bool {
        let Some(edges) = self.waits.get_mut(waiter) else {
            return false;
        };
        let removed = edges.remove(lock_key).is_some();
        if edges.is_empty() {
            self.waits.remove(waiter);
        }
        removed
    }

    pub fn add_hold(&mut self, lease: HeldLease) {
        self.holders
            .entry(lease.lock_key.clone())
            .or_default()
            .insert(lease.holder.clone(), lease);
    }

    pub fn remove_hold(&mut self, holder: &WaiterId, lock_key: &str) -> Option<HeldLease> {
        let leases = self.holders.get_mut(lock_key)?;
        let removed = leases.remove(holder);
        if leases.is_empty() {
            self.holders.remove(lock_key);
        }
        removed
    }

    /// Holders that block `waiter`, sorted. A waiter blocked by its own
    /// hold (read-to-write upgrade) lists itself. A blocked reader also
    /// lists every writer waiting on the same resource with `blocks_readers`.
    pub fn blockers(&self, waiter: &WaiterId) -> Vec<WaiterId> {
        let mut out = BTreeSet::new();
        let Some(edges) = self.waits.get(waiter) else {
            return Vec::new();
        };
        for edge in edges.values() {
            if let Some(leases) = self.holders.get(&edge.lock_key) {
                out.extend(
                    leases
                        .values()
                        .filter(|lease| conflicts(edge.lock_type, lease.lock_type))
                        .map(|lease| lease.holder.clone()),
                );
            }
            if edge.lock_type == LockType::Read {
                out.extend(self.readers_gated_by(waiter, &edge.lock_key));
            }
        }
        out.into_iter().collect()
    }

    fn readers_gated_by<'a>(
        &'a self,
        reader: &'a WaiterId,
        lock_key: &'a str,
    ) -> impl Iterator<Item = WaiterId> + 'a {
        self.waits
            .iter()
            .filter(move |(other, _)| *other != reader)
            .filter(move |(_, edges)| edges.get(lock_key).is_some_and(|e| e.blocks_readers))
            .map(|(other, _)| other.clone())
    }

    /// Depth-first search from `origin` for a path back to it.
    ///
    /// Returns the cycle as the recursion-stack path starting at `origin`.
    pub fn find_cycle_from(&self, origin: &WaiterId) -> Option<Vec<WaiterId>> {
        let mut visited = BTreeSet::new();
        let mut path = vec![origin.clone()];
        visited.insert(origin.clone());
        if self.search_back_to(origin, origin, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn search_back_to(
        &self,
        origin: &WaiterId,
        current: &WaiterId,
        visited: &mut BTreeSet<WaiterId>,
        path: &mut Vec<WaiterId>,
    ) -> bool {
        for next in self.blockers(current) {
            if &next == origin {
                return true;
            }
            if !visited.insert(next.clone()) {
                continue;
            }
            path.push(next.clone());
            if self.search_back_to(origin, &next, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    /// Every cycle reachable by a full DFS over all waiters.
    ///
    /// Cycles are canonicalized, deduplicated and sorted, so two scans of an
    /// unchanged graph return identical results.
    pub fn find_cycles(&self) -> Vec<Vec<WaiterId>> {
        let mut on_stack: HashMap<WaiterId, usize> = HashMap::new();
        let mut done: BTreeSet<WaiterId> = BTreeSet::new();
        let mut stack: Vec<WaiterId> = Vec::new();
        let mut found: BTreeSet<Vec<WaiterId>> = BTreeSet::new();

        for start in self.waits.keys() {
            if !done.contains(start) {
                self.collect_cycles(start, &mut on_stack, &mut done, &mut stack, &mut found);
            }
        }
        found.into_iter().collect()
    }

    fn collect_cycles(
        &self,
        node: &WaiterId,
        on_stack: &mut HashMap<WaiterId, usize>,
        done: &mut BTreeSet<WaiterId>,
        stack: &mut Vec<WaiterId>,
        found: &mut BTreeSet<Vec<WaiterId>>,
    ) {
        on_stack.insert(node.clone(), stack.len());
        stack.push(node.clone());

        for next in self.blockers(node) {
            if let Some(&pos) = on_stack.get(&next) {
                found.insert(canonicalize(stack[pos..].to_vec()));
            } else if !done.contains(&next) {
                self.collect_cycles(&next, on_stack, done, stack, found);
            }
        }

        stack.pop();
        on_stack.remove(node);
        done.insert(node.clone());
    }

    pub fn wait_edges(&self) -> Vec<WaitEdge> {
        self.waits
            .values()
            .flat_map(|edges| edges.values().cloned())
            .collect()
    }

    pub fn held_leases(&self) -> Vec<HeldLease> {
        self.holders
            .values()
            .flat_map(|leases| leases.values().cloned())
            .collect()
    }

    pub fn leases_held_by(&self, holder: &WaiterId) -> Vec<HeldLease> {
        self.holders
            .values()
            .filter_map(|leases| leases.get(holder).cloned())
            .collect()
    }

    /// Graph keys `waiter` currently waits on
    pub fn waits_of(&self, waiter: &WaiterId) -> Vec<String> {
        self.waits
            .get(waiter)
            .map(|edges| edges.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_waits(&self) -> bool {
        !self.waits.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.holders.is_empty()
    }

    pub fn wait_count(&self) -> usize {
        self.waits.values().map(BTreeMap::len).sum()
    }

    pub fn hold_count(&self) -> usize {
        self.holders.values().map(BTreeMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.waits.clear();
        self.holders.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn waiter(name: &str) -> WaiterId {
        WaiterId::new("node-1", name)
    }

    pub(crate) fn wait(who: &WaiterId, key: &str, lock_type: LockType) -> WaitEdge {
        WaitEdge {
            waiter: who.clone(),
            lock_key: key.to_string(),
            lock_type,
            since_ms: 0,
            blocks_readers: false,
        }
    }

    fn priority_write(who: &WaiterId, key: &str) -> WaitEdge {
        WaitEdge {
            blocks_readers: true,
            ..wait(who, key, LockType::Write)
        }
    }

    pub(crate) fn hold(who: &WaiterId, key: &str, lock_type: LockType) -> HeldLease {
        HeldLease {
            holder: who.clone(),
            lock_key: key.to_string(),
            lock_type,
            resource: LockKey::new("res", key.replace(':', "-")).unwrap(),
            token: format!("token-{}", who.client_id),
        }
    }

    #[test]
    fn test_two_party_cycle() {
        let (a, b) = (waiter("a"), waiter("b"));
        let graph = WaitForGraph::from_parts(
            [
                wait(&a, "x", LockType::Exclusive),
                wait(&b, "y", LockType::Exclusive),
            ],
            [
                hold(&b, "x", LockType::Exclusive),
                hold(&a, "y", LockType::Exclusive),
            ],
        );

        assert_eq!(graph.find_cycle_from(&a), Some(vec![a.clone(), b.clone()]));
        assert_eq!(graph.find_cycle_from(&b), Some(vec![b.clone(), a.clone()]));
        assert_eq!(graph.find_cycles(), vec![vec![a, b]]);
    }

    #[test]
    fn test_chain_without_cycle() {
        let (a, b, c) = (waiter("a"), waiter("b"), waiter("c"));
        let graph = WaitForGraph::from_parts(
            [
                wait(&a, "x", LockType::Exclusive),
                wait(&b, "y", LockType::Exclusive),
            ],
            [
                hold(&b, "x", LockType::Exclusive),
                hold(&c, "y", LockType::Exclusive),
            ],
        );

        assert_eq!(graph.blockers(&a), vec![b.clone()]);
        assert!(graph.find_cycle_from(&a).is_none());
        assert!(graph.find_cycles().is_empty());
    }

    #[test]
    fn test_shared_reads_do_not_block_each_other() {
        let (a, b) = (waiter("a"), waiter("b"));
        let graph = WaitForGraph::from_parts(
            [
                wait(&a, "rw", LockType::Read),
                wait(&b, "x", LockType::Exclusive),
            ],
            [
                hold(&b, "rw", LockType::Read),
                hold(&a, "x", LockType::Exclusive),
            ],
        );

        assert!(graph.blockers(&a).is_empty());
        assert!(graph.find_cycles().is_empty());
    }

    #[test]
    fn test_upgrade_blocks_on_own_read() {
        let a = waiter("a");
        let graph = WaitForGraph::from_parts(
            [wait(&a, "rw", LockType::Write)],
            [hold(&a, "rw", LockType::Read)],
        );

        assert_eq!(graph.find_cycle_from(&a), Some(vec![a.clone()]));
        assert_eq!(graph.find_cycles(), vec![vec![a]]);
    }

    #[test]
    fn test_cycle_through_waiting_priority_writer() {
        let (r1, r2, w) = (waiter("r1"), waiter("r2"), waiter("w"));
        let waits = [
            priority_write(&w, "rw"),
            wait(&r1, "x", LockType::Exclusive),
            wait(&r2, "rw", LockType::Read),
        ];
        let holds = [
            hold(&r1, "rw", LockType::Read),
            hold(&r2, "x", LockType::Exclusive),
        ];
        let graph = WaitForGraph::from_parts(waits.clone(), holds.clone());

        assert_eq!(graph.blockers(&r2), vec![w.clone()]);
        assert_eq!(
            graph.find_cycles(),
            vec![vec![r1.clone(), r2.clone(), w.clone()]]
        );

        // without writer priority the reader is not gated and nothing cycles
        let plain = WaitForGraph::from_parts(
            waits.into_iter().map(|e| WaitEdge {
                blocks_readers: false,
                ..e
            }),
            holds,
        );
        assert!(plain.blockers(&r2).is_empty());
        assert!(plain.find_cycles().is_empty());
    }

    #[test]
    fn test_refresh_keeps_first_timestamp() {
        let a = waiter("a");
        let mut graph = WaitForGraph::new();
        let mut edge = wait(&a, "x", LockType::Exclusive);
        edge.since_ms = 10;
        assert!(graph.add_wait(edge.clone()));
        edge.since_ms = 20;
        assert!(!graph.add_wait(edge));

        assert_eq!(graph.wait_edges()[0].since_ms, 10);
        assert!(graph.remove_wait(&a, "x"));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_canonical_rotation_and_victim() {
        let (a, b, c) = (waiter("a"), waiter("b"), waiter("c"));
        let cycle = canonicalize(vec![c.clone(), a.clone(), b.clone()]);
        assert_eq!(cycle, vec![a.clone(), b, c]);
        assert_eq!(select_victim(&cycle), Some(&a));

        let remote = WaiterId::new("node-0", "z");
        assert_eq!(select_victim(&[a, remote.clone()]), Some(&remote));
    }

    #[test]
    fn test_three_party_cycle_found_once() {
        let (a, b, c) = (waiter("a"), waiter("b"), waiter("c"));
        let graph = WaitForGraph::from_parts(
            [
                wait(&a, "x", LockType::Exclusive),
                wait(&b, "y", LockType::Exclusive),
                wait(&c, "z", LockType::Fair),
            ],
            [
                hold(&b, "x", LockType::Exclusive),
                hold(&c, "y", LockType::Exclusive),
                hold(&a, "z", LockType::Fair),
            ],
        );

        let cycles = graph.find_cycles();
        assert_eq!(cycles, vec![vec![a.clone(), b.clone(), c.clone()]]);
        assert_eq!(graph.find_cycles(), cycles);
    }

    proptest! {
        // Waiter i only ever waits on resources held by waiters j > i,
        // so the graph is a DAG and no cycle may be reported.
        #[test]
        fn prop_no_false_positives_on_acyclic_waits(
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            let mut graph = WaitForGraph::new();
            for j in 0..12 {
                let holder = waiter(&format!("w{:02}", j));
                graph.add_hold(hold(&holder, &format!("k{:02}", j), LockType::Exclusive));
            }
            for (i, j) in edges {
                let (lo, hi) = if i < j { (i, j) } else if j < i { (j, i) } else { continue };
                let who = waiter(&format!("w{:02}", lo));
                graph.add_wait(wait(&who, &format!("k{:02}", hi), LockType::Exclusive));
            }

            prop_assert!(graph.find_cycles().is_empty());
            for i in 0..12 {
                let start = waiter(&format!("w{:02}", i));
                prop_assert!(graph.find_cycle_from(&start).is_none());
            }
        }
    }
}
