//! The wait-for graph.

use crate::types::TransactionId;
use std::collections::{HashMap, HashSet};

/// Who waits for whom, keyed by transaction id.
///
/// Each transaction waits for at most one other. Detecting a deadlock only
/// walks ids; it never touches the transactions themselves.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// victim → blocker
    blocked_on: HashMap<TransactionId, TransactionId>,
    /// blocker → victims
    waiters: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl WaitForGraph {
    /// Records that `victim` waits for `blocker`, replacing whatever
    /// `victim` waited for before.
    pub fn add_edge(&mut self, victim: TransactionId, blocker: TransactionId) {
        self.remove_edge(victim);
        self.blocked_on.insert(victim, blocker);
        self.waiters.entry(blocker).or_default().insert(victim);
    }

    /// Clears what `victim` waits for.
    pub fn remove_edge(&mut self, victim: TransactionId) {
        if let Some(old) = self.blocked_on.remove(&victim) {
            if let Some(set) = self.waiters.get_mut(&old) {
                set.remove(&victim);
                if set.is_empty() {
                    self.waiters.remove(&old);
                }
            }
        }
    }

    /// Removes `tx` entirely. Returns the transactions that were waiting
    /// for it; their edges are gone too.
    pub fn remove_transaction(&mut self, tx: TransactionId) -> Vec<TransactionId> {
        self.remove_edge(tx);
        let waiters: Vec<TransactionId> = self
            .waiters
            .remove(&tx)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for waiter in &waiters {
            self.blocked_on.remove(waiter);
        }
        waiters
    }

    /// What `victim` waits for.
    #[must_use]
    pub fn blocker_of(&self, victim: TransactionId) -> Option<TransactionId> {
        self.blocked_on.get(&victim).copied()
    }

    /// Follows the chain of blockers from `victim`. Returns the cycle,
    /// starting at `victim`, if the chain leads back to it.
    #[must_use]
    pub fn find_cycle(&self, victim: TransactionId) -> Option<Vec<TransactionId>> {
        let mut path = vec![victim];
        let mut seen = HashSet::from([victim]);
        let mut current = self.blocker_of(victim)?;
        loop {
            if current == victim {
                return Some(path);
            }
            if !seen.insert(current) {
                // A cycle further down the chain, not through `victim`.
                return None;
            }
            path.push(current);
            current = self.blocker_of(current)?;
        }
    }

    /// Number of waiting transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocked_on.len()
    }

    /// Whether nobody waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocked_on.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn chain_without_cycle() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(t(1), t(2));
        graph.add_edge(t(2), t(3));
        assert_eq!(graph.find_cycle(t(1)), None);
        assert_eq!(graph.find_cycle(t(3)), None);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn cycle_through_victim() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(t(1), t(2));
        graph.add_edge(t(2), t(3));
        graph.add_edge(t(3), t(1));
        assert_eq!(graph.find_cycle(t(3)), Some(vec![t(3), t(1), t(2)]));
    }

    #[test]
    fn cycle_elsewhere_is_not_reported() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(t(2), t(3));
        graph.add_edge(t(3), t(2));
        graph.add_edge(t(1), t(2));
        assert_eq!(graph.find_cycle(t(1)), None);
    }

    #[test]
    fn new_edge_replaces_old() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(t(1), t(2));
        graph.add_edge(t(1), t(3));
        assert_eq!(graph.blocker_of(t(1)), Some(t(3)));
        assert!(graph.remove_transaction(t(2)).is_empty());
        assert_eq!(graph.remove_transaction(t(3)), vec![t(1)]);
        assert!(graph.is_empty());
    }

    #[test]
    fn removal_releases_every_waiter() {
        let mut graph = WaitForGraph::default();
        graph.add_edge(t(1), t(9));
        graph.add_edge(t(2), t(9));
        graph.add_edge(t(9), t(5));
        let mut released = graph.remove_transaction(t(9));
        released.sort();
        assert_eq!(released, vec![t(1), t(2)]);
        assert!(graph.is_empty());
    }
}
