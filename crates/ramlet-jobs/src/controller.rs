//! Job server and the controller it runs
//!
//! A job server is one long-running process listening on a fixed port. Every
//! job it accepts brings its own reservation, which becomes a private memory
//! pool that sub-requests are carved from. Sub-request replies come back on
//! the server port; a finished job is reported to the ports of the request
//! that started it.

use async_trait::async_trait;
use ramlet_core::{
    IdCounter, JobSpec, JobState, JobsConfig, Message, Pid, Request, RequestKind, Reservation,
    Status, TaskId,
};
use ramlet_runtime::{kill_and_wait, Oracle, ProcessContext, Program, RpcContext, Runtime};
use ramlet_scheduler::{threads_for, MemoryPool, JOB_FINISHED};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::handlers::{handler_for, CycleInput, SubTask};

/// A sub-request in flight and the capacity it holds
#[derive(Debug, Clone)]
struct Outstanding {
    action: String,
    reservation: Reservation,
}

/// One job and its private slice of capacity
pub struct Job {
    pub spec: JobSpec,
    pub state: JobState,
    /// Stop re-arming; the job ends once nothing is outstanding
    pub finish: bool,
    /// Money taken so far
    pub money: f64,
    pool: MemoryPool,
    outstanding: HashMap<TaskId, Outstanding>,
    idle: Vec<(TaskId, Pid)>,
    report_ports: Vec<u16>,
}

impl Job {
    pub fn new(spec: JobSpec, state: JobState) -> Self {
        let pool = MemoryPool::from_reservation(&spec.reserved);
        Self {
            spec,
            state,
            finish: false,
            money: 0.0,
            pool,
            outstanding: HashMap::new(),
            idle: Vec::new(),
            report_ports: Vec::new(),
        }
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn label(&self) -> String {
        format!("{} {}", self.spec.kind, self.spec.target)
    }
}

/// Runs every job handed to one job server
pub struct JobController {
    runtime: Arc<dyn Runtime>,
    oracle: Arc<dyn Oracle>,
    config: JobsConfig,
    kill_poll: Duration,
    jobs: HashMap<TaskId, Job>,
    ids: IdCounter,
}

impl JobController {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        oracle: Arc<dyn Oracle>,
        config: JobsConfig,
        kill_poll: Duration,
    ) -> Self {
        Self {
            runtime,
            oracle,
            config,
            kill_poll,
            jobs: HashMap::new(),
            ids: IdCounter::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, id: TaskId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Route one message read from the server port
    pub async fn handle(&mut self, message: Message) {
        let request = match message {
            Message::Reply(request) => request,
            Message::Log(line) => {
                info!(source = ?line.source, label = %line.label, "{}", line.text);
                return;
            }
        };

        if let Some(spec) = request.param::<JobSpec>("job") {
            self.accept(spec, request.reply_ports()).await;
        } else if request.param::<String>("command").as_deref() == Some("stop") {
            match request.job_id {
                Some(job_id) => self.stop(job_id).await,
                None => warn!("Stop command without a job id"),
            }
        } else if let Some(job_id) = request.job_id {
            self.on_sub_reply(job_id, request).await;
        } else {
            warn!(event = %request.event(), "Job server ignored a message");
        }
    }

    /// Take a new job and run its first cycle
    pub async fn accept(&mut self, spec: JobSpec, report_ports: Vec<u16>) {
        let id = spec.id;
        if self.jobs.contains_key(&id) {
            warn!(job_id = %id, "Job already running");
            return;
        }
        let mut job = Job::new(spec, JobState::Idle);
        job.report_ports = report_ports;
        info!(
            job_id = %id,
            job = %job.label(),
            threads = job.spec.reserved.total_threads,
            "Job accepted"
        );
        self.jobs.insert(id, job);
        self.cycle(id).await;
        self.settle(id).await;
    }

    /// Stop re-arming a job; it finishes once its sub-requests are back
    pub async fn stop(&mut self, id: TaskId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            warn!(job_id = %id, "Stop for unknown job");
            return;
        };
        job.finish = true;
        info!(job_id = %id, outstanding = job.outstanding(), "Job stopping");
        self.settle(id).await;
    }

    async fn on_sub_reply(&mut self, id: TaskId, reply: Request) {
        let Some(job) = self.jobs.get_mut(&id) else {
            debug!(job_id = %id, "Reply for a job that already ended");
            return;
        };
        if let Some(sub_id) = reply.id {
            match job.outstanding.remove(&sub_id) {
                Some(entry) => {
                    job.pool.release(sub_id, &entry.reservation);
                    debug!(job_id = %id, sub_id = %sub_id, action = %entry.action, "Sub-request done");
                }
                None => warn!(job_id = %id, sub_id = %sub_id, "Reply for unknown sub-request"),
            }
        }
        if let Some(error) = reply.result::<String>("error") {
            warn!(job_id = %id, action = %reply.event(), error = %error, "Sub-request failed");
        }
        job.money += reply.result::<f64>("money").unwrap_or(0.0);

        if handler_for(job.spec.kind).on_sub_reply(job, &reply) {
            self.cycle(id).await;
        }
        self.settle(id).await;
    }

    /// Decide what an otherwise idle job does next
    async fn settle(&mut self, id: TaskId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if !job.outstanding.is_empty() {
            return;
        }
        let again = match self.oracle.target(&job.spec.target) {
            Ok(state) => job.state != JobState::Done && handler_for(job.spec.kind).on_idle(job, &state),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Target unavailable");
                false
            }
        };
        if again && self.cycle(id).await > 0 {
            return;
        }
        self.finish(id).await;
    }

    /// Reclaim idle work, launch the next sub-requests, refill idle work
    ///
    /// Returns the number of threads launched.
    async fn cycle(&mut self, id: TaskId) -> u32 {
        self.reclaim_idle(id).await;
        let mut launched = 0;
        for task in self.plan_cycle(id) {
            launched += self.launch(id, task).await;
        }
        self.fill_idle(id).await;
        launched
    }

    /// Ask the job's handler what to launch against the target's current state
    fn plan_cycle(&mut self, id: TaskId) -> Vec<SubTask> {
        let Some(job) = self.jobs.get_mut(&id) else {
            return Vec::new();
        };
        let state = match self.oracle.target(&job.spec.target) {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Target unavailable");
                job.state = JobState::Done;
                return Vec::new();
            }
        };
        let weaken_cost = self
            .runtime
            .program_cost(&RequestKind::Action("weaken".into()).program())
            .unwrap_or(0.0);
        let input = CycleInput {
            state,
            constants: self.oracle.constants(),
            oracle: self.oracle.as_ref(),
            config: &self.config,
            available: job.pool.available_threads(weaken_cost),
        };
        let tasks = handler_for(job.spec.kind).setup(job, &input);
        debug!(job_id = %id, state = ?job.state, tasks = tasks.len(), "Cycle planned");
        tasks
    }

    /// Reserve and start one sub-task, split across nodes as needed
    async fn launch(&mut self, id: TaskId, task: SubTask) -> u32 {
        let program = RequestKind::Action(task.action.to_string()).program();
        let Some(cost) = self.runtime.program_cost(&program) else {
            warn!(program = %program, "Sub-request program missing");
            return 0;
        };
        let Some(job) = self.jobs.get_mut(&id) else {
            return 0;
        };
        let grants = job.pool.reserve_split(cost, task.threads, &mut self.ids);
        let mut launched = 0;
        for (sub_id, reservation) in grants {
            let Some(host) = reservation.first_host().map(str::to_string) else {
                continue;
            };
            let mut request = Request::action(
                format!("{} {}", task.action, job.spec.target),
                task.action,
            )
            .with_target(job.spec.target.clone());
            request.id = Some(sub_id);
            request.job_id = Some(id);
            request.ports = vec![self.config.server_port];
            request.delay_ms = task.delay_ms;
            request.rearm = task.rearm;
            request.threads = reservation.total_threads;
            request.host = Some(host.clone());
            request.reserved = Some(reservation.clone());

            let arg = match serde_json::to_string(&request) {
                Ok(arg) => arg,
                Err(e) => {
                    warn!(error = %e, "Could not encode sub-request");
                    job.pool.release(sub_id, &reservation);
                    continue;
                }
            };
            match self
                .runtime
                .exec(&program, &host, request.threads, arg)
                .await
            {
                Ok(pid) => {
                    debug!(
                        job_id = %id,
                        sub_id = %sub_id,
                        pid = %pid,
                        action = task.action,
                        threads = request.threads,
                        delay_ms = task.delay_ms,
                        "Sub-request started"
                    );
                    launched += request.threads;
                    job.outstanding.insert(
                        sub_id,
                        Outstanding {
                            action: task.action.to_string(),
                            reservation,
                        },
                    );
                }
                Err(e) => {
                    warn!(job_id = %id, host = %host, error = %e, "Sub-request failed to start");
                    job.pool.release(sub_id, &reservation);
                }
            }
        }
        if launched < task.threads {
            debug!(
                job_id = %id,
                action = task.action,
                requested = task.threads,
                granted = launched,
                "Sub-request partially granted"
            );
        }
        launched
    }

    /// Put leftover job capacity to background use
    async fn fill_idle(&mut self, id: TaskId) {
        let program = RequestKind::Action(self.config.idle_program.clone()).program();
        let Some(cost) = self.runtime.program_cost(&program) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if job.finish {
            return;
        }
        let free: Vec<(String, f64)> = job
            .pool
            .ledgers()
            .iter()
            .map(|l| (l.node().to_string(), l.free()))
            .collect();
        for (host, free) in free {
            let threads = threads_for(free, cost);
            if threads == 0 {
                continue;
            }
            let idle_id = self.ids.next();
            if !job.pool.reserve_on(&host, idle_id, threads as f64 * cost) {
                continue;
            }
            let mut request = Request::action("Idle work", self.config.idle_program.clone());
            request.id = Some(idle_id);
            request.job_id = Some(id);
            request.threads = threads;
            request.host = Some(host.clone());
            let arg = match serde_json::to_string(&request) {
                Ok(arg) => arg,
                Err(e) => {
                    warn!(job_id = %id, host = %host, error = %e, "Could not encode idle work");
                    job.pool.release_id(idle_id);
                    continue;
                }
            };
            match self.runtime.exec(&program, &host, threads, arg).await {
                Ok(pid) => job.idle.push((idle_id, pid)),
                Err(e) => {
                    debug!(host = %host, error = %e, "Could not start idle work");
                    job.pool.release_id(idle_id);
                }
            }
        }
    }

    async fn reclaim_idle(&mut self, id: TaskId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        for (idle_id, pid) in std::mem::take(&mut job.idle) {
            kill_and_wait(self.runtime.as_ref(), pid, self.kill_poll).await;
            job.pool.release_id(idle_id);
        }
    }

    /// Report a job as finished and forget it
    async fn finish(&mut self, id: TaskId) {
        self.reclaim_idle(id).await;
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        job.state = JobState::Done;

        let mut report = Request::action(job.label(), JOB_FINISHED).with_target(job.spec.target.clone());
        report.id = Some(id);
        report.status = Some(Status::Completed);
        report.set_result("money", job.money);
        report.set_result("state", job.state);
        let message = Message::Reply(report);
        for port in &job.report_ports {
            if let Err(e) = self.runtime.ports().write(*port, &message).await {
                warn!(job_id = %id, port = port, error = %e, "Job report not delivered");
            }
        }
        info!(job_id = %id, job = %job.label(), money = job.money, "Job done");
    }
}

/// The long-running process hosting a [`JobController`]
pub struct JobServer {
    oracle: Arc<dyn Oracle>,
    config: JobsConfig,
    kill_poll: Duration,
}

impl JobServer {
    pub fn new(oracle: Arc<dyn Oracle>, config: JobsConfig, kill_poll: Duration) -> Self {
        Self {
            oracle,
            config,
            kill_poll,
        }
    }
}

#[async_trait]
impl Program for JobServer {
    async fn run(&self, ctx: ProcessContext) {
        let Some(rpc) = RpcContext::parse_or_warn(&ctx) else {
            return;
        };
        let mut inbox = match ctx.runtime.ports().open(self.config.server_port) {
            Ok(inbox) => inbox,
            Err(e) => {
                rpc.exit_with_error(e).await;
                return;
            }
        };
        info!(pid = %ctx.pid, node = %ctx.node, port = self.config.server_port, "Job server started");

        let mut controller = JobController::new(
            ctx.runtime.clone(),
            self.oracle.clone(),
            self.config.clone(),
            self.kill_poll,
        );
        controller.handle(Message::Reply(rpc.request.clone())).await;

        let poll = Duration::from_millis(self.config.poll_ms);
        loop {
            while let Some(message) = inbox.try_read() {
                controller.handle(message).await;
            }
            if !controller.is_empty() {
                tokio::time::sleep(poll).await;
                continue;
            }

            // Writers now see a closed port and retry against the next server
            inbox.close();
            let late: Vec<Message> = std::iter::from_fn(|| inbox.try_read()).collect();
            if late.is_empty() {
                break;
            }
            debug!(messages = late.len(), "Messages arrived while closing, reopening port");
            inbox = match ctx.runtime.ports().open(self.config.server_port) {
                Ok(reopened) => reopened,
                Err(e) => {
                    error!(port = self.config.server_port, error = %e, "Job server could not reopen its port");
                    break;
                }
            };
            for message in late {
                controller.handle(message).await;
            }
        }
        info!(pid = %ctx.pid, "Job server has no jobs left");
        drop(inbox);
        rpc.exit().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::register_programs;
    use ramlet_core::{Assignment, JobKind, ThreadPlan, WorldConfig};
    use ramlet_runtime::programs::register_builtin;
    use ramlet_runtime::{PortReader, SimRuntime, SimWorld};

    fn world() -> (Arc<SimRuntime>, Arc<SimWorld>, JobsConfig) {
        let config = WorldConfig::default();
        let jobs = JobsConfig::default();
        let world = Arc::new(SimWorld::new("home", &config));
        let runtime = SimRuntime::new(50, Duration::from_millis(10));
        for node in &config.nodes {
            runtime.add_node(node.name.clone(), node.max_ram);
        }
        register_builtin(&runtime, world.clone(), &config);
        register_programs(&runtime, world.clone(), &jobs, &config, Duration::from_millis(100));
        (runtime, world, jobs)
    }

    fn spec(kind: JobKind, ram: f64, threads: u32) -> JobSpec {
        let mut reserved = Reservation::default();
        reserved.push(Assignment {
            host: "home".into(),
            ram,
            threads,
        });
        JobSpec {
            id: TaskId(5),
            kind,
            target: "n00dles".into(),
            min_security: 1.0,
            max_money: 70_000.0,
            plan: ThreadPlan::default(),
            reserved,
        }
    }

    async fn start_server(runtime: &Arc<SimRuntime>, spec: &JobSpec) {
        let mut request = Request::server("Job n00dles", "jobs", 19)
            .with_target("n00dles")
            .with_param("job", spec);
        request.id = Some(TaskId(4));
        let arg = serde_json::to_string(&request).unwrap();
        runtime
            .exec("rpc/servers/jobs", "home", 1, arg)
            .await
            .unwrap();
    }

    async fn next_reply(inbox: &mut PortReader, event: &str) -> Request {
        loop {
            match inbox.read().await {
                Some(Message::Reply(reply)) if reply.event() == event => return reply,
                Some(_) => continue,
                None => panic!("port closed"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_weaken_job_runs_to_min_security() {
        let (runtime, world, _) = world();
        let mut inbox = runtime.ports().open(20).unwrap();
        start_server(&runtime, &spec(JobKind::Weaken, 32.0, 18)).await;

        let finished = next_reply(&mut inbox, JOB_FINISHED).await;
        assert_eq!(finished.id, Some(TaskId(5)));
        assert_eq!(finished.status, Some(Status::Completed));
        assert!(world.target("n00dles").unwrap().at_min_security());

        let server = next_reply(&mut inbox, "jobs").await;
        assert_eq!(server.id, Some(TaskId(4)));
        assert!(runtime.running("rpc/idle").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_job_after_outstanding_work() {
        let (runtime, _world, _) = world();
        let mut inbox = runtime.ports().open(20).unwrap();
        start_server(&runtime, &spec(JobKind::Hack, 16.0, 9)).await;

        let mut stop = Request::server("Stop job", "jobs", 19).with_param("command", "stop");
        stop.job_id = Some(TaskId(5));
        runtime.ports().write(19, &Message::Reply(stop)).await.unwrap();

        let finished = next_reply(&mut inbox, JOB_FINISHED).await;
        assert_eq!(finished.id, Some(TaskId(5)));
        assert_eq!(finished.result::<f64>("money"), Some(0.0));
        assert_eq!(finished.result::<JobState>("state"), Some(JobState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_requests_stay_inside_job_reservation() {
        let (runtime, world, jobs) = world();
        let mut controller =
            JobController::new(runtime.clone(), world, jobs, Duration::from_millis(100));
        let server_inbox = runtime.ports().open(19).unwrap();
        controller.accept(spec(JobKind::Weaken, 8.0, 4), vec![20]).await;

        let job = controller.job(TaskId(5)).unwrap();
        assert_eq!(job.state, JobState::NeedsWeaken);
        assert_eq!(job.outstanding(), 1);
        assert!(job.pool().free("home") < 1.75);
        assert_eq!(runtime.running("rpc/weaken").len(), 1);
        assert!(runtime.used_ram("home") <= 8.0);
        drop(server_inbox);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_sub_reply_is_ignored() {
        let (runtime, world, jobs) = world();
        let mut controller = JobController::new(runtime.clone(), world, jobs, Duration::from_millis(100));
        let mut stray = Request::action("weaken n00dles", "weaken");
        stray.job_id = Some(TaskId(77));
        controller.handle(Message::Reply(stray)).await;
        assert!(controller.is_empty());
    }
}
