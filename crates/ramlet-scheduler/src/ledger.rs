//! Per-node capacity accounting

use ramlet_core::TaskId;
use std::collections::HashMap;
use tracing::debug;

/// Total and reserved capacity of one node
///
/// The ledger is a plain accumulator: it never rejects over-commitment.
/// Callers only ever reserve what [`CapacityLedger::free`] last reported.
#[derive(Debug, Clone)]
pub struct CapacityLedger {
    node: String,
    capacity: f64,
    reserved: HashMap<TaskId, f64>,
}

impl CapacityLedger {
    /// Create a ledger with nothing reserved
    pub fn new(node: impl Into<String>, capacity: f64) -> Self {
        Self {
            node: node.into(),
            capacity,
            reserved: HashMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Add `amount` to the entry for `id`, creating it if absent
    pub fn reserve(&mut self, id: TaskId, amount: f64) {
        *self.reserved.entry(id).or_insert(0.0) += amount;
        debug!(node = %self.node, task_id = %id, amount = amount, "Reserved capacity");
    }

    /// Remove the entry for `id`, returning the full amount it held
    ///
    /// Releasing an id that holds nothing is a no-op.
    pub fn release(&mut self, id: TaskId) -> f64 {
        match self.reserved.remove(&id) {
            Some(amount) => {
                debug!(node = %self.node, task_id = %id, amount = amount, "Released capacity");
                amount
            }
            None => 0.0,
        }
    }

    /// Take back part of an entry; the entry goes away once it reaches zero
    pub fn unreserve(&mut self, id: TaskId, amount: f64) -> f64 {
        let Some(held) = self.reserved.get_mut(&id) else {
            return 0.0;
        };
        let taken = amount.min(*held);
        *held -= taken;
        if *held <= f64::EPSILON {
            self.reserved.remove(&id);
        }
        taken
    }

    pub fn reserved_by(&self, id: TaskId) -> f64 {
        self.reserved.get(&id).copied().unwrap_or(0.0)
    }

    pub fn reserved_total(&self) -> f64 {
        self.reserved.values().sum()
    }

    /// Capacity minus everything reserved
    pub fn free(&self) -> f64 {
        self.capacity - self.reserved_total()
    }

    /// Replace the capacity, e.g. after a node upgrade
    pub fn set_capacity(&mut self, capacity: f64) {
        self.capacity = capacity;
    }

    /// Add capacity handed over to this ledger
    pub fn grow_capacity(&mut self, amount: f64) {
        self.capacity += amount;
    }

    pub fn holders(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.reserved.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_additive() {
        let mut ledger = CapacityLedger::new("home", 64.0);
        ledger.reserve(TaskId(1), 8.0);
        ledger.reserve(TaskId(1), 8.0);
        ledger.reserve(TaskId(2), 4.0);
        assert_eq!(ledger.reserved_by(TaskId(1)), 16.0);
        assert_eq!(ledger.free(), 44.0);
    }

    #[test]
    fn test_release_frees_whole_entry() {
        let mut ledger = CapacityLedger::new("home", 64.0);
        ledger.reserve(TaskId(1), 8.0);
        ledger.reserve(TaskId(1), 8.0);
        assert_eq!(ledger.release(TaskId(1)), 16.0);
        assert_eq!(ledger.free(), 64.0);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut ledger = CapacityLedger::new("home", 64.0);
        ledger.reserve(TaskId(1), 8.0);
        assert_eq!(ledger.release(TaskId(99)), 0.0);
        assert_eq!(ledger.reserved_by(TaskId(1)), 8.0);
        assert_eq!(ledger.free(), 56.0);
    }

    #[test]
    fn test_unreserve_partial() {
        let mut ledger = CapacityLedger::new("A", 16.0);
        ledger.reserve(TaskId(3), 10.0);
        assert_eq!(ledger.unreserve(TaskId(3), 4.0), 4.0);
        assert_eq!(ledger.reserved_by(TaskId(3)), 6.0);
        assert_eq!(ledger.unreserve(TaskId(3), 20.0), 6.0);
        assert_eq!(ledger.holders().count(), 0);
    }
}
