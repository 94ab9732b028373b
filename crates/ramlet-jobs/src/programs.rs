//! Planning programs and job server registration

use async_trait::async_trait;
use ramlet_core::{JobKind, JobsConfig, ThreadPlan, WorldConfig};
use ramlet_runtime::{Oracle, ProcessContext, Program, RpcContext, SimRuntime, TargetState};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::controller::JobServer;
use crate::optimizer::{
    default_split, estimate, grow_threads_needed, plan_hack, weaken_threads_needed, SearchLimits,
    TargetProfile,
};

/// Answers a planning action with the thread plan for one job kind
pub struct PlanProgram {
    oracle: Arc<dyn Oracle>,
    config: JobsConfig,
    kind: JobKind,
}

impl PlanProgram {
    pub fn new(oracle: Arc<dyn Oracle>, config: JobsConfig, kind: JobKind) -> Self {
        Self {
            oracle,
            config,
            kind,
        }
    }

    /// Thread plan for `target` within `budget` threads
    ///
    /// Without a budget a hack plan scans up from `target_percent`.
    pub fn plan(
        &self,
        target: &str,
        state: &TargetState,
        budget: Option<u32>,
        target_percent: f64,
    ) -> Option<ThreadPlan> {
        let constants = self.oracle.constants();
        let growth = |multiplier: f64| self.oracle.growth_threads(target, multiplier).unwrap_or(0.0);
        let weaken = weaken_threads_needed(state.security, state.min_security, constants.sec_per_weaken);
        let cap = budget.unwrap_or(u32::MAX);

        let plan = match self.kind {
            JobKind::Weaken => ThreadPlan {
                weaken,
                sub_total: weaken,
                count: 1,
                total: weaken.min(cap),
                ..ThreadPlan::default()
            },
            JobKind::Grow => {
                let grow = grow_threads_needed(state.money, state.max_money, &growth);
                let grow_weaken = weaken_threads_needed(
                    grow as f64 * constants.sec_per_grow,
                    0.0,
                    constants.sec_per_weaken,
                );
                let sub_total = weaken + grow + grow_weaken;
                ThreadPlan {
                    grow,
                    grow_weaken,
                    weaken,
                    sub_total,
                    count: 1,
                    total: sub_total.min(cap),
                    ..ThreadPlan::default()
                }
            }
            JobKind::Hack => {
                let profile = TargetProfile {
                    hack_fraction: state.hack_fraction,
                    constants,
                };
                let Some(budget) = budget else {
                    let plan = default_split(&profile, &growth, target_percent);
                    return Some(ThreadPlan { weaken, ..plan });
                };
                let limits = SearchLimits {
                    scan_limit: self.config.scan_limit,
                    search_iterations: self.config.search_iterations,
                };
                let mut plan = plan_hack(
                    &profile,
                    &growth,
                    budget,
                    state.weaken_ms,
                    self.config.batch_spacing_ms,
                    limits,
                )?;
                plan.weaken = weaken;
                plan
            }
        };
        Some(plan)
    }
}

#[async_trait]
impl Program for PlanProgram {
    async fn run(&self, ctx: ProcessContext) {
        let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) else {
            return;
        };
        let target = rpc.target().to_string();
        let budget: Option<u32> = rpc.request.param("budget");
        let target_percent = rpc
            .request
            .param("hack_target_percent")
            .unwrap_or(self.config.hack_target_percent);
        let state = match self.oracle.target(&target) {
            Ok(state) => state,
            Err(e) => {
                rpc.exit_with_error(e).await;
                return;
            }
        };

        let plan = self.plan(&target, &state, budget, target_percent).unwrap_or_else(|| {
            debug!(target = %target, budget = ?budget, "No split fits the budget, planning one hack");
            let profile = TargetProfile {
                hack_fraction: state.hack_fraction,
                constants: self.oracle.constants(),
            };
            let growth = |m: f64| self.oracle.growth_threads(&target, m).unwrap_or(0.0);
            estimate(&profile, &growth, 1)
        });
        debug!(target = %target, kind = %self.kind, total = plan.total, "Planned job");
        rpc.set_result("plan", plan);
        rpc.set_result("min_security", state.min_security);
        rpc.set_result("max_money", state.max_money);
        rpc.exit().await;
    }
}

/// Register the job server and the three planning programs
pub fn register_programs(
    runtime: &SimRuntime,
    oracle: Arc<dyn Oracle>,
    config: &JobsConfig,
    world: &WorldConfig,
    kill_poll: Duration,
) {
    runtime.register(
        "rpc/servers/jobs",
        world.ram_for("rpc/servers/jobs"),
        Arc::new(JobServer::new(oracle.clone(), config.clone(), kill_poll)),
    );
    for kind in [JobKind::Weaken, JobKind::Grow, JobKind::Hack] {
        let path = format!("rpc/{}", kind.planning_action());
        runtime.register(
            path.clone(),
            world.ram_for(&path),
            Arc::new(PlanProgram::new(oracle.clone(), config.clone(), kind)),
        );
    }
}
