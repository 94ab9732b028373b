//! Simulated in-process runtime
//!
//! Processes are tokio tasks. Each node has a fixed amount of RAM; a process
//! holds `cost * threads` of it until its task finishes or is aborted.

use async_trait::async_trait;
use ramlet_core::{Pid, RamletError, RamletResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::ports::PortRegistry;
use crate::traits::{ProcessContext, Program, Runtime};

const RAM_EPSILON: f64 = 1e-3;

struct ProgramEntry {
    cost: f64,
    program: Arc<dyn Program>,
}

struct ProcessEntry {
    program: String,
    node: String,
    ram: f64,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct SimState {
    max_ram: HashMap<String, f64>,
    used_ram: HashMap<String, f64>,
    processes: HashMap<Pid, ProcessEntry>,
}

impl SimState {
    fn remove(&mut self, pid: Pid) -> Option<ProcessEntry> {
        let entry = self.processes.remove(&pid)?;
        if let Some(used) = self.used_ram.get_mut(&entry.node) {
            *used = (*used - entry.ram).max(0.0);
        }
        Some(entry)
    }
}

/// Frees a process's RAM when its task ends, however it ends
struct ExitGuard {
    runtime: Weak<SimRuntime>,
    pid: Pid,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            if let Some(entry) = runtime.state().remove(self.pid) {
                debug!(pid = %self.pid, program = %entry.program, "Process exited");
            }
        }
    }
}

/// Runtime running registered programs as tokio tasks
pub struct SimRuntime {
    me: Weak<SimRuntime>,
    ports: PortRegistry,
    programs: Mutex<HashMap<String, ProgramEntry>>,
    state: Mutex<SimState>,
    next_pid: AtomicU32,
}

impl SimRuntime {
    pub fn new(channel_capacity: usize, write_retry: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ports: PortRegistry::new(channel_capacity, write_retry),
            programs: Mutex::new(HashMap::new()),
            state: Mutex::new(SimState::default()),
            next_pid: AtomicU32::new(1),
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn programs(&self) -> MutexGuard<'_, HashMap<String, ProgramEntry>> {
        self.programs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a node available for processes
    pub fn add_node(&self, node: impl Into<String>, max_ram: f64) {
        self.state().max_ram.insert(node.into(), max_ram);
    }

    /// Register a program under a path with its per-thread cost
    pub fn register(&self, path: impl Into<String>, cost: f64, program: Arc<dyn Program>) {
        self.programs()
            .insert(path.into(), ProgramEntry { cost, program });
    }

    pub fn used_ram(&self, node: &str) -> f64 {
        self.state().used_ram.get(node).copied().unwrap_or(0.0)
    }

    /// Running processes of a program
    pub fn running(&self, program: &str) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .state()
            .processes
            .iter()
            .filter(|(_, entry)| entry.program == program)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_by_key(|pid| pid.0);
        pids
    }
}

#[async_trait]
impl Runtime for SimRuntime {
    fn program_cost(&self, program: &str) -> Option<f64> {
        self.programs().get(program).map(|entry| entry.cost)
    }

    async fn exec(
        &self,
        program: &str,
        node: &str,
        threads: u32,
        arg: String,
    ) -> RamletResult<Pid> {
        let (cost, code) = {
            let programs = self.programs();
            let entry = programs
                .get(program)
                .ok_or_else(|| RamletError::ProgramMissing(program.to_string()))?;
            (entry.cost, entry.program.clone())
        };
        let runtime = self
            .me
            .upgrade()
            .ok_or_else(|| RamletError::Internal("runtime dropped".to_string()))?;
        let ram = cost * threads as f64;
        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));

        {
            let mut state = self.state();
            let max = *state
                .max_ram
                .get(node)
                .ok_or_else(|| RamletError::UnknownNode(node.to_string()))?;
            let used = state.used_ram.entry(node.to_string()).or_insert(0.0);
            if threads == 0 || *used + ram > max + RAM_EPSILON {
                warn!(
                    program = program,
                    node = node,
                    threads = threads,
                    ram = ram,
                    "Not enough RAM to start process"
                );
                return Err(RamletError::ProcessStartFailure(format!(
                    "{} on {} needs {:.2} GB",
                    program, node, ram
                )));
            }
            *used += ram;
            state.processes.insert(
                pid,
                ProcessEntry {
                    program: program.to_string(),
                    node: node.to_string(),
                    ram,
                    abort: None,
                },
            );
        }

        let ctx = ProcessContext {
            pid,
            node: node.to_string(),
            threads,
            arg,
            runtime: runtime.clone(),
        };
        let guard = ExitGuard {
            runtime: self.me.clone(),
            pid,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            code.run(ctx).await;
        });
        if let Some(entry) = self.state().processes.get_mut(&pid) {
            entry.abort = Some(handle.abort_handle());
        }

        info!(pid = %pid, program = program, node = node, threads = threads, "Started process");
        Ok(pid)
    }

    async fn is_running(&self, pid: Pid) -> bool {
        self.state().processes.contains_key(&pid)
    }

    async fn kill(&self, pid: Pid) -> bool {
        let abort = match self.state().processes.get(&pid) {
            Some(entry) => entry.abort.clone(),
            None => return false,
        };
        if let Some(abort) = abort {
            debug!(pid = %pid, "Killing process");
            abort.abort();
        }
        true
    }

    fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::kill_and_wait;

    struct Forever;

    #[async_trait]
    impl Program for Forever {
        async fn run(&self, _ctx: ProcessContext) {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    struct Quick;

    #[async_trait]
    impl Program for Quick {
        async fn run(&self, _ctx: ProcessContext) {}
    }

    fn runtime() -> Arc<SimRuntime> {
        let runtime = SimRuntime::new(8, Duration::from_millis(10));
        runtime.add_node("home", 32.0);
        runtime.register("rpc/idle", 4.0, Arc::new(Forever));
        runtime.register("rpc/quick", 2.0, Arc::new(Quick));
        runtime
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_accounts_ram() {
        let runtime = runtime();
        let pid = runtime.exec("rpc/idle", "home", 4, "{}".into()).await.unwrap();
        assert_eq!(runtime.used_ram("home"), 16.0);
        assert!(runtime.is_running(pid).await);
        assert_eq!(runtime.running("rpc/idle"), vec![pid]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_rejects_missing_program_and_overcommit() {
        let runtime = runtime();
        let err = runtime.exec("rpc/nope", "home", 1, "{}".into()).await.unwrap_err();
        assert!(matches!(err, RamletError::ProgramMissing(_)));

        let err = runtime.exec("rpc/idle", "home", 9, "{}".into()).await.unwrap_err();
        assert!(matches!(err, RamletError::ProcessStartFailure(_)));
        assert_eq!(runtime.used_ram("home"), 0.0);

        let err = runtime.exec("rpc/idle", "elsewhere", 1, "{}".into()).await.unwrap_err();
        assert!(matches!(err, RamletError::UnknownNode(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_process_frees_ram() {
        let runtime = runtime();
        let pid = runtime.exec("rpc/quick", "home", 2, "{}".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!runtime.is_running(pid).await);
        assert_eq!(runtime.used_ram("home"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_and_wait_frees_ram() {
        let runtime = runtime();
        let pid = runtime.exec("rpc/idle", "home", 8, "{}".into()).await.unwrap();
        assert_eq!(runtime.used_ram("home"), 32.0);

        assert!(kill_and_wait(runtime.as_ref(), pid, Duration::from_millis(100)).await);
        assert!(!runtime.is_running(pid).await);
        assert_eq!(runtime.used_ram("home"), 0.0);
        assert!(!runtime.kill(pid).await);
    }
}
