//! Built-in programs of the simulated environment

use async_trait::async_trait;
use ramlet_core::WorldConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::rpc::RpcContext;
use crate::sim::SimRuntime;
use crate::traits::{Oracle, ProcessContext, Program};
use crate::world::SimWorld;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafOp {
    Weaken,
    Grow,
    Hack,
}

/// One of the three target operations, run with the process's threads
pub struct LeafProgram {
    world: Arc<SimWorld>,
    op: LeafOp,
}

#[async_trait]
impl Program for LeafProgram {
    async fn run(&self, ctx: ProcessContext) {
        let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) else {
            return;
        };
        rpc.delay().await;
        let target = rpc.target().to_string();
        if let Ok(state) = self.world.target(&target) {
            let latency = match self.op {
                LeafOp::Weaken => state.weaken_ms,
                LeafOp::Grow => state.grow_ms,
                LeafOp::Hack => state.hack_ms,
            };
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let outcome = match self.op {
            LeafOp::Weaken => self
                .world
                .weaken(&target, ctx.threads)
                .map(|v| ("security_removed", v)),
            LeafOp::Grow => self
                .world
                .grow(&target, ctx.threads)
                .map(|v| ("multiplier", v)),
            LeafOp::Hack => self.world.hack(&target, ctx.threads).map(|v| ("money", v)),
        };
        match outcome {
            Ok((key, value)) => {
                rpc.set_result(key, value);
                rpc.exit().await;
            }
            Err(e) => rpc.exit_with_error(e).await,
        }
    }
}

/// Sleeps for the request's delay, then replies
pub struct WaitProgram;

#[async_trait]
impl Program for WaitProgram {
    async fn run(&self, ctx: ProcessContext) {
        if let Some(rpc) = RpcContext::parse_or_warn(&ctx) {
            rpc.delay().await;
            rpc.exit().await;
        }
    }
}

/// Preemptible background work; runs until killed and never replies
pub struct IdleProgram;

#[async_trait]
impl Program for IdleProgram {
    async fn run(&self, ctx: ProcessContext) {
        debug!(pid = %ctx.pid, node = %ctx.node, threads = ctx.threads, "Idle work started");
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
}

/// Replies with the full node graph under `servers` and the owned `openers`
pub struct GetAllServers {
    oracle: Arc<dyn Oracle>,
}

#[async_trait]
impl Program for GetAllServers {
    async fn run(&self, ctx: ProcessContext) {
        if let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) {
            rpc.set_result("servers", self.oracle.discover());
            rpc.set_result("openers", self.oracle.openers());
            rpc.exit().await;
        }
    }
}

/// Replies with one node's attributes under `server`
pub struct ServerDetails {
    oracle: Arc<dyn Oracle>,
}

#[async_trait]
impl Program for ServerDetails {
    async fn run(&self, ctx: ProcessContext) {
        let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) else {
            return;
        };
        match self.oracle.details(rpc.target()) {
            Ok(update) => {
                rpc.set_result("server", update);
                rpc.exit().await;
            }
            Err(e) => rpc.exit_with_error(e).await,
        }
    }
}

/// Tries to root the target; replies with `rooted` and `openers`
pub struct RootServer {
    oracle: Arc<dyn Oracle>,
}

#[async_trait]
impl Program for RootServer {
    async fn run(&self, ctx: ProcessContext) {
        let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) else {
            return;
        };
        rpc.set_result("openers", self.oracle.openers());
        match self.oracle.root(rpc.target()) {
            Ok(rooted) => {
                rpc.set_result("rooted", rooted);
                rpc.exit().await;
            }
            Err(e) => rpc.exit_with_error(e).await,
        }
    }
}

/// Replies with the per-thread effect constants under `constants`
pub struct HackConstantsProgram {
    oracle: Arc<dyn Oracle>,
}

#[async_trait]
impl Program for HackConstantsProgram {
    async fn run(&self, ctx: ProcessContext) {
        if let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) {
            rpc.set_result("constants", self.oracle.constants());
            rpc.exit().await;
        }
    }
}

/// Register every built-in program with its configured cost
pub fn register_builtin(runtime: &SimRuntime, world: Arc<SimWorld>, config: &WorldConfig) {
    let oracle: Arc<dyn Oracle> = world.clone();
    let leaf = |op| -> Arc<dyn Program> {
        Arc::new(LeafProgram {
            world: world.clone(),
            op,
        })
    };
    let programs: Vec<(&str, Arc<dyn Program>)> = vec![
        ("rpc/weaken", leaf(LeafOp::Weaken)),
        ("rpc/grow", leaf(LeafOp::Grow)),
        ("rpc/hack", leaf(LeafOp::Hack)),
        ("rpc/wait", Arc::new(WaitProgram)),
        ("rpc/idle", Arc::new(IdleProgram)),
        (
            "rpc/get-all-servers",
            Arc::new(GetAllServers {
                oracle: oracle.clone(),
            }),
        ),
        (
            "rpc/server-details",
            Arc::new(ServerDetails {
                oracle: oracle.clone(),
            }),
        ),
        (
            "rpc/root-server",
            Arc::new(RootServer {
                oracle: oracle.clone(),
            }),
        ),
        (
            "rpc/hack-constants",
            Arc::new(HackConstantsProgram { oracle }),
        ),
    ];
    for (path, program) in programs {
        runtime.register(path, config.ram_for(path), program);
    }
}
