//! Per-kind job behavior
//!
//! Each job kind decides what one cycle launches, whether a completed
//! sub-request starts the next cycle, and whether an idle job re-arms.

use ramlet_core::{HackConstants, JobKind, JobState, JobsConfig, Request};
use ramlet_runtime::{Oracle, TargetState};

use crate::controller::Job;
use crate::optimizer::{grow_threads_needed, weaken_threads_needed};

/// One sub-request a cycle wants launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTask {
    pub action: &'static str,
    pub threads: u32,
    pub delay_ms: u64,
    /// Completion of this sub-request starts the next cycle
    pub rearm: bool,
}

impl SubTask {
    fn new(action: &'static str, threads: u32, delay_ms: u64) -> Self {
        Self {
            action,
            threads,
            delay_ms,
            rearm: false,
        }
    }
}

/// What a handler sees when planning a cycle
pub struct CycleInput<'a> {
    pub state: TargetState,
    pub constants: HackConstants,
    pub oracle: &'a dyn Oracle,
    pub config: &'a JobsConfig,
    /// Weaken-cost threads still free in the job's pool
    pub available: u32,
}

impl CycleInput<'_> {
    fn weaken_to_min(&self) -> u32 {
        weaken_threads_needed(
            self.state.security,
            self.state.min_security,
            self.constants.sec_per_weaken,
        )
    }

    fn grow_from(&self, money: f64, target: &str) -> u32 {
        let growth = |multiplier: f64| self.oracle.growth_threads(target, multiplier).unwrap_or(0.0);
        grow_threads_needed(money, self.state.max_money, &growth)
    }

    fn weaken_after(&self, security_added: f64) -> u32 {
        weaken_threads_needed(security_added, 0.0, self.constants.sec_per_weaken)
    }
}

/// Behavior of one job kind
pub trait JobHandler: Send + Sync {
    /// Sub-requests for the next cycle, given the target's current state
    fn setup(&self, job: &mut Job, input: &CycleInput<'_>) -> Vec<SubTask>;

    /// A sub-request completed; returns whether the next cycle starts now
    fn on_sub_reply(&self, job: &mut Job, reply: &Request) -> bool;

    /// Nothing is outstanding; returns whether to run another cycle
    fn on_idle(&self, job: &mut Job, state: &TargetState) -> bool;
}

/// Delays that make operations with `latencies` finish `step_ms` apart, in order
///
/// The common instant is the longest latency plus one step.
pub fn aligned_delays(latencies: &[u64], step_ms: u64) -> Vec<u64> {
    let longest = latencies.iter().copied().max().unwrap_or(0);
    let instant = longest + step_ms;
    latencies
        .iter()
        .enumerate()
        .map(|(i, latency)| instant + i as u64 * step_ms - latency)
        .collect()
}

/// Grow to max money with a trailing weaken landing after it
fn grow_phase(input: &CycleInput<'_>, target: &str) -> Vec<SubTask> {
    let grow = input.grow_from(input.state.money, target);
    let weaken = input.weaken_after(grow as f64 * input.constants.sec_per_grow) + input.weaken_to_min();
    let delays = aligned_delays(
        &[input.state.grow_ms, input.state.weaken_ms],
        input.config.step_ms,
    );
    [
        SubTask::new("grow", grow, delays[0]),
        SubTask::new("weaken", weaken, delays[1]),
    ]
    .into_iter()
    .filter(|task| task.threads > 0)
    .collect()
}

/// Drive security to its minimum
pub struct WeakenJob;

impl JobHandler for WeakenJob {
    fn setup(&self, job: &mut Job, input: &CycleInput<'_>) -> Vec<SubTask> {
        let weaken = input.weaken_to_min();
        if weaken == 0 {
            job.state = JobState::Done;
            return Vec::new();
        }
        job.state = JobState::NeedsWeaken;
        vec![SubTask::new("weaken", weaken, 0)]
    }

    fn on_sub_reply(&self, _job: &mut Job, _reply: &Request) -> bool {
        false
    }

    fn on_idle(&self, job: &mut Job, state: &TargetState) -> bool {
        !job.finish && !state.at_min_security()
    }
}

/// Drive security to its minimum, then money to its maximum
pub struct GrowJob;

impl JobHandler for GrowJob {
    fn setup(&self, job: &mut Job, input: &CycleInput<'_>) -> Vec<SubTask> {
        if !input.state.at_min_security() {
            job.state = JobState::NeedsWeaken;
            return vec![SubTask::new("weaken", input.weaken_to_min(), 0)];
        }
        if !input.state.at_max_money() {
            job.state = JobState::NeedsGrow;
            return grow_phase(input, &job.spec.target);
        }
        job.state = JobState::Done;
        Vec::new()
    }

    fn on_sub_reply(&self, _job: &mut Job, _reply: &Request) -> bool {
        false
    }

    fn on_idle(&self, job: &mut Job, state: &TargetState) -> bool {
        !job.finish && !(state.at_min_security() && state.at_max_money())
    }
}

/// Prepare the target, then run aligned hack batches until stopped
pub struct HackJob;

impl HackJob {
    fn batches(&self, job: &Job, input: &CycleInput<'_>) -> Vec<SubTask> {
        let plan = job.spec.plan;
        let state = &input.state;
        let step = input.config.step_ms;
        let delays = aligned_delays(&[state.hack_ms, state.weaken_ms, state.grow_ms, state.weaken_ms], step);

        let hack = plan.hack.max(1);
        let taken = (hack as f64 * state.hack_fraction).min(0.99);
        let grow = input.grow_from(state.money * (1.0 - taken), &job.spec.target);
        let hack_weaken = input
            .weaken_after(hack as f64 * input.constants.sec_per_hack)
            .max(plan.hack_weaken);
        let grow_weaken = input.weaken_after(grow as f64 * input.constants.sec_per_grow);
        let drift = input.weaken_to_min();

        let mut tasks = Vec::new();
        let mut last_delay = 0;
        for batch in 0..plan.count.max(1) {
            let offset = batch as u64 * input.config.batch_spacing_ms;
            let correction = if batch == 0 { drift } else { 0 };
            tasks.push(SubTask::new("hack", hack, delays[0] + offset));
            tasks.push(SubTask::new("weaken", hack_weaken + correction, delays[1] + offset));
            tasks.push(SubTask::new("grow", grow, delays[2] + offset));
            tasks.push(SubTask::new("weaken", grow_weaken, delays[3] + offset));
            last_delay = delays[3] + offset;
        }
        tasks.retain(|task| task.threads > 0);

        tasks.push(SubTask {
            rearm: true,
            ..SubTask::new("weaken", 1, last_delay + input.config.rearm_delay_ms)
        });

        let used: u32 = tasks.iter().map(|task| task.threads).sum();
        if input.available.saturating_sub(used) >= plan.sub_total {
            tasks.push(SubTask {
                rearm: true,
                ..SubTask::new("wait", 1, input.config.wait_delay_ms)
            });
        }
        tasks
    }
}

impl JobHandler for HackJob {
    fn setup(&self, job: &mut Job, input: &CycleInput<'_>) -> Vec<SubTask> {
        if job.finish {
            return Vec::new();
        }
        if !input.state.at_min_security() {
            job.state = JobState::NeedsWeaken;
            return vec![SubTask::new("weaken", input.weaken_to_min(), 0)];
        }
        if !input.state.at_max_money() {
            job.state = JobState::NeedsGrow;
            return grow_phase(input, &job.spec.target);
        }
        job.state = JobState::Working;
        self.batches(job, input)
    }

    fn on_sub_reply(&self, job: &mut Job, reply: &Request) -> bool {
        reply.rearm && !job.finish
    }

    fn on_idle(&self, job: &mut Job, _state: &TargetState) -> bool {
        !job.finish
    }
}

/// Handler implementing a job kind
pub fn handler_for(kind: JobKind) -> &'static dyn JobHandler {
    match kind {
        JobKind::Weaken => &WeakenJob,
        JobKind::Grow => &GrowJob,
        JobKind::Hack => &HackJob,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramlet_core::{JobSpec, NodeUpdate, RamletResult, Reservation, TaskId, ThreadPlan};

    struct FixedOracle;

    impl Oracle for FixedOracle {
        fn target(&self, _host: &str) -> RamletResult<TargetState> {
            Ok(state(1.0, 1000.0))
        }
        fn growth_threads(&self, _host: &str, multiplier: f64) -> RamletResult<f64> {
            Ok((multiplier - 1.0) * 100.0)
        }
        fn constants(&self) -> HackConstants {
            HackConstants::default()
        }
        fn discover(&self) -> Vec<NodeUpdate> {
            Vec::new()
        }
        fn details(&self, host: &str) -> RamletResult<NodeUpdate> {
            Ok(NodeUpdate {
                hostname: host.into(),
                ..NodeUpdate::default()
            })
        }
        fn root(&self, _host: &str) -> RamletResult<bool> {
            Ok(true)
        }
        fn openers(&self) -> u8 {
            0
        }
    }

    fn state(security: f64, money: f64) -> TargetState {
        TargetState {
            security,
            min_security: 1.0,
            money,
            max_money: 1000.0,
            hack_fraction: 0.01,
            hack_ms: 2000,
            grow_ms: 6400,
            weaken_ms: 8000,
        }
    }

    fn job(kind: JobKind, plan: ThreadPlan) -> Job {
        Job::new(
            JobSpec {
                id: TaskId(1),
                kind,
                target: "n00dles".into(),
                min_security: 1.0,
                max_money: 1000.0,
                plan,
                reserved: Reservation::default(),
            },
            JobState::NeedsWeaken,
        )
    }

    fn input<'a>(config: &'a JobsConfig, state: TargetState, available: u32) -> CycleInput<'a> {
        CycleInput {
            state,
            constants: HackConstants::default(),
            oracle: &FixedOracle,
            config,
            available,
        }
    }

    #[test]
    fn test_aligned_delays_finish_in_order() {
        let delays = aligned_delays(&[2000, 8000, 6400, 8000], 1000);
        assert_eq!(delays, vec![7000, 2000, 4600, 4000]);
        let finishes: Vec<u64> = delays
            .iter()
            .zip([2000, 8000, 6400, 8000])
            .map(|(delay, latency)| delay + latency)
            .collect();
        assert_eq!(finishes, vec![9000, 10000, 11000, 12000]);
    }

    #[test]
    fn test_weaken_job_recomputes_from_current_state() {
        let config = JobsConfig::default();
        let mut weaken = job(JobKind::Weaken, ThreadPlan::default());
        let tasks = WeakenJob.setup(&mut weaken, &input(&config, state(3.0, 500.0), 100));
        assert_eq!(tasks, vec![SubTask::new("weaken", 40, 0)]);
        assert_eq!(weaken.state, JobState::NeedsWeaken);

        let tasks = WeakenJob.setup(&mut weaken, &input(&config, state(1.0, 500.0), 100));
        assert!(tasks.is_empty());
        assert_eq!(weaken.state, JobState::Done);
        assert!(!WeakenJob.on_idle(&mut weaken, &state(1.0, 500.0)));
        assert!(WeakenJob.on_idle(&mut weaken, &state(1.5, 500.0)));
    }

    #[test]
    fn test_grow_job_phases() {
        let config = JobsConfig::default();
        let mut grow = job(JobKind::Grow, ThreadPlan::default());
        let tasks = GrowJob.setup(&mut grow, &input(&config, state(1.0, 500.0), 100));
        assert_eq!(grow.state, JobState::NeedsGrow);
        assert_eq!(tasks[0].action, "grow");
        assert_eq!(tasks[0].threads, 100);
        assert_eq!(tasks[1].action, "weaken");
        assert_eq!(tasks[1].threads, 8);
        assert!(tasks[0].delay_ms + 6400 < tasks[1].delay_ms + 8000);

        assert!(GrowJob.on_idle(&mut grow, &state(1.0, 900.0)));
        assert!(!GrowJob.on_idle(&mut grow, &state(1.0, 1000.0)));
    }

    #[test]
    fn test_hack_job_batches_and_rearm() {
        let config = JobsConfig::default();
        let plan = ThreadPlan {
            hack_fraction: 0.1,
            hack: 10,
            hack_weaken: 1,
            grow: 12,
            grow_weaken: 1,
            sub_total: 24,
            count: 2,
            total: 48,
            ..ThreadPlan::default()
        };
        let mut hack = job(JobKind::Hack, plan);
        let tasks = HackJob.setup(&mut hack, &input(&config, state(1.0, 1000.0), 48));
        assert_eq!(hack.state, JobState::Working);

        let actions: Vec<&str> = tasks.iter().map(|t| t.action).collect();
        assert_eq!(
            actions,
            vec!["hack", "weaken", "grow", "weaken", "hack", "weaken", "grow", "weaken", "weaken"]
        );
        assert_eq!(tasks[4].delay_ms - tasks[0].delay_ms, config.batch_spacing_ms);
        let trailing = tasks.last().unwrap();
        assert!(trailing.rearm);
        assert_eq!(trailing.threads, 1);
        assert_eq!(trailing.delay_ms, tasks[7].delay_ms + config.rearm_delay_ms);

        let mut reply = Request::action("weaken", "weaken");
        reply.rearm = true;
        assert!(HackJob.on_sub_reply(&mut hack, &reply));
        hack.finish = true;
        assert!(!HackJob.on_sub_reply(&mut hack, &reply));
        assert!(!HackJob.on_idle(&mut hack, &state(1.0, 1000.0)));
    }

    #[test]
    fn test_hack_job_adds_wait_when_capacity_left() {
        let config = JobsConfig::default();
        let plan = ThreadPlan {
            hack: 10,
            hack_weaken: 1,
            sub_total: 24,
            count: 1,
            total: 24,
            ..ThreadPlan::default()
        };
        let mut hack = job(JobKind::Hack, plan);
        let tasks = HackJob.setup(&mut hack, &input(&config, state(1.0, 1000.0), 200));
        let wait = tasks.last().unwrap();
        assert_eq!(wait.action, "wait");
        assert!(wait.rearm);
        assert_eq!(wait.delay_ms, config.wait_delay_ms);
    }

    #[test]
    fn test_hack_job_prepares_target_first() {
        let config = JobsConfig::default();
        let mut hack = job(JobKind::Hack, ThreadPlan::default());
        let tasks = HackJob.setup(&mut hack, &input(&config, state(2.0, 1000.0), 100));
        assert_eq!(hack.state, JobState::NeedsWeaken);
        assert_eq!(tasks, vec![SubTask::new("weaken", 20, 0)]);

        HackJob.setup(&mut hack, &input(&config, state(1.0, 400.0), 100));
        assert_eq!(hack.state, JobState::NeedsGrow);
    }
}
