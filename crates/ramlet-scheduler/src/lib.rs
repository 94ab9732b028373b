//! ramlet-scheduler: Memory-aware dispatcher for ramlet
//!
//! This crate provides the scheduling side of ramlet:
//! - Per-node capacity ledgers and the memory pool built on them
//! - Node classification (usable, rootable, port-blocked, useless)
//! - The central dispatcher loop and its reply handlers
//! - Eviction of preemptible background work

pub mod dispatcher;
pub mod handlers;
pub mod idle;
pub mod ledger;
pub mod pool;
pub mod registry;

pub use dispatcher::{Dispatcher, InFlight, Priority, Step, Task, TaskOutcome};
pub use handlers::{JOB_COST_PROGRAM, JOB_FINISHED, JOB_SERVER};
pub use ledger::CapacityLedger;
pub use pool::{threads_for, MemoryPool, ReservationTxn};
pub use registry::{NodeClass, NodeRegistry};
