//! Memory pool: turns thread requests into per-node assignments

use ramlet_core::{Assignment, IdCounter, Reservation, TaskId};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::ledger::CapacityLedger;

/// Threads of `cost` that fit in `free`
pub fn threads_for(free: f64, cost: f64) -> u32 {
    if cost <= 0.0 || free <= 0.0 {
        return 0;
    }
    (free / cost + 1e-9).floor() as u32
}

/// A set of ordered capacity ledgers
///
/// Nodes are scanned in insertion order, never sorted by free capacity.
#[derive(Debug, Default)]
pub struct MemoryPool {
    ledgers: Vec<CapacityLedger>,
    index: HashMap<String, usize>,
    home: Option<String>,
    baseline: f64,
}

impl MemoryPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool whose home node always withholds `baseline`
    pub fn with_home(home: impl Into<String>, baseline: f64) -> Self {
        Self {
            home: Some(home.into()),
            baseline,
            ..Self::default()
        }
    }

    /// Private pool scoped to the capacity a reservation holds
    pub fn from_reservation(reservation: &Reservation) -> Self {
        let mut pool = Self::new();
        for assignment in &reservation.hosts {
            match pool.index.get(&assignment.host) {
                Some(&i) => pool.ledgers[i].grow_capacity(assignment.ram),
                None => pool.add_node(assignment.host.clone(), assignment.ram),
            }
        }
        pool
    }

    /// Append a node, or update its capacity if already known
    pub fn add_node(&mut self, node: impl Into<String>, capacity: f64) {
        let node = node.into();
        match self.index.get(&node) {
            Some(&i) => self.ledgers[i].set_capacity(capacity),
            None => {
                self.index.insert(node.clone(), self.ledgers.len());
                self.ledgers.push(CapacityLedger::new(node.clone(), capacity));
            }
        }
        if self.home.as_deref() == Some(node.as_str()) {
            self.reserve_baseline();
        }
    }

    /// Withhold the home node's permanent footprint
    fn reserve_baseline(&mut self) {
        let Some(home) = self.home.clone() else {
            return;
        };
        let baseline = self.baseline;
        if let Some(ledger) = self.ledger_mut(&home) {
            let missing = baseline - ledger.reserved_by(TaskId::BASELINE);
            if missing > 0.0 {
                ledger.reserve(TaskId::BASELINE, missing.min(ledger.free().max(0.0)));
            }
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.index.contains_key(node)
    }

    pub fn ledger(&self, node: &str) -> Option<&CapacityLedger> {
        self.index.get(node).map(|&i| &self.ledgers[i])
    }

    fn ledger_mut(&mut self, node: &str) -> Option<&mut CapacityLedger> {
        let i = *self.index.get(node)?;
        self.ledgers.get_mut(i)
    }

    pub fn ledgers(&self) -> &[CapacityLedger] {
        &self.ledgers
    }

    pub fn free(&self, node: &str) -> f64 {
        self.ledger(node).map(|l| l.free()).unwrap_or(0.0)
    }

    pub fn total_free(&self) -> f64 {
        self.ledgers.iter().map(|l| l.free().max(0.0)).sum()
    }

    /// Threads of `cost` the pool could grant right now, reserving nothing
    pub fn available_threads(&self, cost: f64) -> u32 {
        self.ledgers
            .iter()
            .map(|l| threads_for(l.free(), cost))
            .sum()
    }

    /// Reserve `requested` threads of `cost` under `id`, greedily across nodes
    ///
    /// The returned transaction must be committed or aborted; dropping it
    /// undecided aborts it.
    pub fn reserve_threads(&mut self, cost: f64, requested: u32, id: TaskId) -> ReservationTxn<'_> {
        self.reserve_baseline();
        let mut reservation = Reservation::default();
        let mut remaining = requested;
        for ledger in self.ledgers.iter_mut() {
            if remaining == 0 {
                break;
            }
            let free = ledger.free();
            let threads = threads_for(free, cost).min(remaining);
            if threads == 0 {
                continue;
            }
            let ram = (threads as f64 * cost).min(free);
            ledger.reserve(id, ram);
            reservation.push(Assignment {
                host: ledger.node().to_string(),
                ram,
                threads,
            });
            remaining -= threads;
        }
        debug!(
            task_id = %id,
            requested = requested,
            granted = reservation.total_threads,
            "Reserved threads"
        );
        ReservationTxn {
            pool: self,
            id,
            requested,
            reservation,
            decided: false,
        }
    }

    /// Reserve up to `requested` threads with one fresh id per node
    ///
    /// Each returned reservation covers a single node, so it can back a
    /// single process. Fewer threads than requested may be granted.
    pub fn reserve_split(
        &mut self,
        cost: f64,
        requested: u32,
        ids: &mut IdCounter,
    ) -> Vec<(TaskId, Reservation)> {
        let mut granted = Vec::new();
        let mut remaining = requested;
        for ledger in self.ledgers.iter_mut() {
            if remaining == 0 {
                break;
            }
            let free = ledger.free();
            let threads = threads_for(free, cost).min(remaining);
            if threads == 0 {
                continue;
            }
            let id = ids.next();
            let ram = (threads as f64 * cost).min(free);
            ledger.reserve(id, ram);
            let mut reservation = Reservation::default();
            reservation.push(Assignment {
                host: ledger.node().to_string(),
                ram,
                threads,
            });
            granted.push((id, reservation));
            remaining -= threads;
        }
        granted
    }

    /// Reserve `amount` on one node if it is free there
    pub fn reserve_on(&mut self, node: &str, id: TaskId, amount: f64) -> bool {
        match self.ledger_mut(node) {
            Some(ledger) if ledger.free() + 1e-9 >= amount => {
                ledger.reserve(id, amount);
                true
            }
            _ => false,
        }
    }

    /// Release what `id` holds on every node of `reservation`
    pub fn release(&mut self, id: TaskId, reservation: &Reservation) -> f64 {
        let mut released = 0.0;
        for assignment in &reservation.hosts {
            match self.ledger_mut(&assignment.host) {
                Some(ledger) => released += ledger.release(id),
                None => warn!(task_id = %id, host = %assignment.host, "Release on unknown node"),
            }
        }
        if released > 0.0 {
            info!(task_id = %id, ram = released, "Released reservation");
        }
        released
    }

    /// Release what `id` holds anywhere in the pool
    pub fn release_id(&mut self, id: TaskId) -> f64 {
        self.ledgers.iter_mut().map(|l| l.release(id)).sum()
    }
}

/// An in-progress multi-node reservation
pub struct ReservationTxn<'a> {
    pool: &'a mut MemoryPool,
    id: TaskId,
    requested: u32,
    reservation: Reservation,
    decided: bool,
}

impl ReservationTxn<'_> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn granted(&self) -> u32 {
        self.reservation.total_threads
    }

    pub fn is_satisfied(&self) -> bool {
        self.reservation.total_threads >= self.requested
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Keep every assignment made, satisfied or not
    pub fn commit(mut self) -> Reservation {
        self.decided = true;
        std::mem::take(&mut self.reservation)
    }

    /// Undo every assignment this transaction made
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.decided {
            return;
        }
        self.decided = true;
        for assignment in &self.reservation.hosts {
            if let Some(ledger) = self.pool.ledger_mut(&assignment.host) {
                ledger.unreserve(self.id, assignment.ram);
            }
        }
        if !self.reservation.is_empty() {
            debug!(task_id = %self.id, ram = self.reservation.total_ram, "Rolled back reservation");
        }
    }
}

impl Drop for ReservationTxn<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}
