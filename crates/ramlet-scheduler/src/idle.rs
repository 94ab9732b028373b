//! Preemptible background work on leftover capacity

use ramlet_core::{Pid, Request, TaskId};
use ramlet_runtime::kill_and_wait;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::pool::threads_for;

/// One background process and the capacity it holds
#[derive(Debug, Clone)]
pub struct IdleWork {
    pub id: TaskId,
    pub pid: Pid,
    pub host: String,
    pub threads: u32,
    pub ram: f64,
}

impl Dispatcher {
    /// Fill leftover capacity of every pool node with background work
    ///
    /// Returns the number of threads started.
    pub async fn fill_idle(&mut self) -> u32 {
        let program = ramlet_core::RequestKind::Action(self.jobs_config.idle_program.clone()).program();
        let Some(cost) = self.runtime.program_cost(&program) else {
            return 0;
        };
        let hosts: Vec<(String, f64)> = self
            .pool
            .ledgers()
            .iter()
            .map(|l| (l.node().to_string(), l.free()))
            .collect();

        let mut started = 0;
        for (host, free) in hosts {
            let headroom = if host == self.pool_config.home_node {
                self.pool_config.idle_home_headroom
            } else {
                0.0
            };
            let threads = threads_for(free - headroom, cost);
            if threads == 0 {
                continue;
            }
            let id = self.ids.next();
            let ram = threads as f64 * cost;
            if !self.pool.reserve_on(&host, id, ram) {
                continue;
            }
            let mut request = Request::action("Idle work", self.jobs_config.idle_program.clone());
            request.id = Some(id);
            request.threads = threads;
            request.host = Some(host.clone());
            let arg = match serde_json::to_string(&request) {
                Ok(arg) => arg,
                Err(e) => {
                    warn!(host = %host, error = %e, "Could not encode idle work");
                    self.pool.release_id(id);
                    continue;
                }
            };
            match self.runtime.exec(&program, &host, threads, arg).await {
                Ok(pid) => {
                    debug!(task_id = %id, pid = %pid, host = %host, threads = threads, "Started idle work");
                    self.idle.push(IdleWork {
                        id,
                        pid,
                        host,
                        threads,
                        ram,
                    });
                    started += threads;
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Could not start idle work");
                    self.pool.release_id(id);
                }
            }
        }
        if started > 0 {
            info!(threads = started, "Filled leftover capacity with idle work");
        }
        started
    }

    /// Kill every background process, wait for it to exit, free its capacity
    ///
    /// Returns the number of processes reclaimed.
    pub async fn reclaim_idle(&mut self) -> usize {
        let work = std::mem::take(&mut self.idle);
        let count = work.len();
        let poll = self.kill_poll();
        for item in work {
            kill_and_wait(self.runtime.as_ref(), item.pid, poll).await;
            self.pool.release_id(item.id);
            debug!(task_id = %item.id, host = %item.host, threads = item.threads, "Reclaimed idle work");
        }
        if count > 0 {
            info!(processes = count, "Reclaimed idle capacity");
        }
        count
    }

    pub fn idle_threads(&self) -> u32 {
        self.idle.iter().map(|w| w.threads).sum()
    }

    /// Capacity background work holds on one node
    pub fn idle_ram(&self, host: &str) -> f64 {
        self.idle
            .iter()
            .filter(|w| w.host == host)
            .map(|w| w.ram)
            .sum()
    }
}
