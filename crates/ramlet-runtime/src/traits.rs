//! Runtime trait definitions

use async_trait::async_trait;
use ramlet_core::{HackConstants, NodeUpdate, Pid, RamletResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::ports::PortRegistry;

/// Runtime trait for managing remote processes
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Per-thread capacity cost of a program, `None` if it does not exist
    fn program_cost(&self, program: &str) -> Option<f64>;

    /// Start `program` on `node` with `threads` threads and a single argument
    async fn exec(&self, program: &str, node: &str, threads: u32, arg: String)
        -> RamletResult<Pid>;

    /// Check if a process is still running
    async fn is_running(&self, pid: Pid) -> bool;

    /// Forcefully terminate a process; returns false if it was not running
    async fn kill(&self, pid: Pid) -> bool;

    /// Channels shared by every process of this runtime
    fn ports(&self) -> &PortRegistry;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}

/// Kill a process, then poll liveness until it has actually exited.
pub async fn kill_and_wait(runtime: &dyn Runtime, pid: Pid, poll: Duration) -> bool {
    if !runtime.kill(pid).await {
        return false;
    }
    while runtime.is_running(pid).await {
        tokio::time::sleep(poll).await;
    }
    true
}

/// Everything a started process gets from its runtime
#[derive(Clone)]
pub struct ProcessContext {
    pub pid: Pid,
    pub node: String,
    pub threads: u32,
    /// The serialized request the process was started with
    pub arg: String,
    pub runtime: Arc<dyn Runtime>,
}

/// A unit of work a runtime can execute
#[async_trait]
pub trait Program: Send + Sync {
    async fn run(&self, ctx: ProcessContext);
}

/// Observed state of a target node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub security: f64,
    pub min_security: f64,
    pub money: f64,
    pub max_money: f64,
    /// Money fraction one hack thread takes at the current security
    pub hack_fraction: f64,
    pub hack_ms: u64,
    pub grow_ms: u64,
    pub weaken_ms: u64,
}

impl TargetState {
    pub fn at_min_security(&self) -> bool {
        self.security <= self.min_security
    }

    pub fn at_max_money(&self) -> bool {
        self.money >= self.max_money
    }
}

/// Deterministic effect and timing functions owned by the environment
pub trait Oracle: Send + Sync {
    /// Current state of a target
    fn target(&self, host: &str) -> RamletResult<TargetState>;

    /// Grow threads needed to multiply a target's money by `multiplier`
    fn growth_threads(&self, host: &str, multiplier: f64) -> RamletResult<f64>;

    /// Per-thread security effects
    fn constants(&self) -> HackConstants;

    /// Full node graph, breadth first from the home node
    fn discover(&self) -> Vec<NodeUpdate>;

    /// Attributes of a single node
    fn details(&self, host: &str) -> RamletResult<NodeUpdate>;

    /// Try to gain root on a node
    fn root(&self, host: &str) -> RamletResult<bool>;

    /// Port openers currently owned
    fn openers(&self) -> u8;
}
