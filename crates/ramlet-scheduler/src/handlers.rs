//! Dispatcher reactions to replies, startup sequence and job creation

use ramlet_core::{
    HackConstants, JobKind, JobSpec, NodeUpdate, RamletError, Request, RequestKind, ThreadPlan,
};
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, Priority, Task, TaskOutcome};
use crate::pool::threads_for;
use crate::registry::NodeClass;

/// Server every job controller runs under
pub const JOB_SERVER: &str = "jobs";
/// Event a job controller reports a finished job with
pub const JOB_FINISHED: &str = "job-finished";
/// Program whose per-thread cost sizes job reservations
pub const JOB_COST_PROGRAM: &str = "weaken";

impl Dispatcher {
    /// Register the reply handlers of discovery, rooting, constants and planning
    pub fn install_handlers(&mut self) {
        self.on("get-all-servers", on_servers);
        self.on("server-details", on_server_details);
        self.on("root-server", on_root);
        self.on("hack-constants", on_constants);
        for kind in [JobKind::Weaken, JobKind::Grow, JobKind::Hack] {
            self.on(kind.planning_action(), on_plan);
        }
        self.on(JOB_FINISHED, on_job_finished);
    }

    /// Queue the startup sequence and the periodic tasks
    pub fn bootstrap(&mut self) {
        let discover = Request::action("Discover servers", "get-all-servers");
        self.enqueue(Task::Remote(discover.clone()), Priority::High);
        self.every_ten_minutes(Task::Remote(discover));

        self.wait_on(
            "get-all-servers",
            Task::Remote(Request::action("Load constants", "hack-constants")),
        );
        self.wait_on("get-all-servers", root_task());
        self.every_minute(root_task());

        for job in self.jobs_config.targets.clone() {
            self.wait_on("get-all-servers", plan_task(job.target, job.kind));
        }
        info!(jobs = self.jobs_config.targets.len(), "Startup sequence queued");
    }

    /// Fold a node record into the registry and, if usable, the pool
    pub fn observe(&mut self, update: &NodeUpdate) -> NodeClass {
        let change = self.registry.update(update);
        if change.class == NodeClass::Usable {
            let capacity = self.registry.max_ram(&update.hostname);
            self.pool.add_node(update.hostname.clone(), capacity);
        }
        change.class
    }

    /// Queue a root attempt on the next rootable node, one at a time
    pub fn root_next(&mut self) -> TaskOutcome {
        if self.rooting.is_some() && !self.is_pending("root-server") {
            self.rooting = None;
        }
        if self.rooting.is_some() {
            return TaskOutcome::Success;
        }
        let Some(host) = self.registry.next_root_target() else {
            return TaskOutcome::Success;
        };
        self.rooting = Some(host.clone());
        let request = Request::action(format!("Root {}", host), "root-server").with_target(host);
        self.enqueue(Task::Remote(request), Priority::Normal);
        TaskOutcome::Success
    }

    /// Threads of `cost` a job could get, counting capacity held by idle work
    pub fn job_budget(&self, cost: f64) -> u32 {
        self.pool
            .ledgers()
            .iter()
            .map(|l| threads_for(l.free() + self.idle_ram(l.node()), cost))
            .sum()
    }

    /// Queue the planning request for a job on `target`
    pub fn plan_job(&mut self, target: &str, kind: JobKind) -> TaskOutcome {
        let program = RequestKind::Action(JOB_COST_PROGRAM.to_string()).program();
        let Some(cost) = self.runtime.program_cost(&program) else {
            return TaskOutcome::Fatal(RamletError::ProgramMissing(program));
        };
        let budget = self.job_budget(cost);
        if budget == 0 {
            warn!(target = %target, kind = %kind, "No capacity to plan job, trying next minute");
            self.next_minute(plan_task(target.to_string(), kind));
            return TaskOutcome::Success;
        }
        let request = Request::action(format!("Plan {} {}", kind, target), kind.planning_action())
            .with_target(target)
            .with_param("budget", budget);
        self.enqueue(Task::Remote(request), Priority::Normal);
        TaskOutcome::Success
    }

    /// Turn a planning reply into a reserved job and a job server request
    pub fn start_job(&mut self, reply: &Request) -> TaskOutcome {
        let Some(kind) = JobKind::from_planning_action(reply.event()) else {
            return TaskOutcome::Fatal(RamletError::Internal(format!(
                "{} is not a planning reply",
                reply.event()
            )));
        };
        let Some(target) = reply.target.clone() else {
            return TaskOutcome::Fatal(RamletError::InvalidTarget(reply.label.clone()));
        };
        if let Some(error) = reply.result::<String>("error") {
            return TaskOutcome::Fatal(RamletError::InvalidTarget(format!("{}: {}", target, error)));
        }
        let Some(plan) = reply.result::<ThreadPlan>("plan") else {
            return TaskOutcome::Fatal(RamletError::Internal(format!(
                "planning reply for {} carries no plan",
                target
            )));
        };
        if plan.total == 0 {
            info!(target = %target, kind = %kind, "Job needs no threads");
            return TaskOutcome::Success;
        }

        let program = RequestKind::Action(JOB_COST_PROGRAM.to_string()).program();
        let Some(cost) = self.runtime.program_cost(&program) else {
            return TaskOutcome::Fatal(RamletError::ProgramMissing(program));
        };
        let id = self.ids.next();
        let txn = self.pool.reserve_threads(cost, plan.total, id);
        let granted = txn.granted();
        if granted == 0 {
            txn.abort();
            warn!(target = %target, kind = %kind, "No capacity for job, planning again next minute");
            self.next_minute(plan_task(target, kind));
            return TaskOutcome::Success;
        }
        let reservation = txn.commit();
        if granted < plan.total {
            info!(
                task_id = %id,
                requested = plan.total,
                granted = granted,
                "Job starts with a partial reservation"
            );
        }

        let spec = JobSpec {
            id,
            kind,
            target: target.clone(),
            min_security: reply.result("min_security").unwrap_or(0.0),
            max_money: reply.result("max_money").unwrap_or(0.0),
            plan,
            reserved: reservation.clone(),
        };
        let label = format!("{} {}", kind, target);
        let mut job = Request::action(label.clone(), "job").with_target(target.clone());
        job.id = Some(id);
        job.threads = granted;
        job.reserved = Some(reservation);
        self.track(job, None);

        let server = Request::server(label, JOB_SERVER, self.jobs_config.server_port)
            .with_target(target)
            .with_param("job", &spec);
        self.enqueue(Task::Remote(server), Priority::Normal);
        info!(task_id = %id, kind = %kind, threads = granted, "Job created");
        TaskOutcome::Success
    }

    /// Ask the job server to stop re-arming a job
    pub fn stop_job(&mut self, job_id: ramlet_core::TaskId) {
        let mut stop = Request::server("Stop job", JOB_SERVER, self.jobs_config.server_port)
            .with_param("command", "stop");
        stop.job_id = Some(job_id);
        self.enqueue(Task::Remote(stop), Priority::High);
    }
}

fn root_task() -> Task {
    Task::local("Root next server", |d: &mut Dispatcher| d.root_next())
}

fn plan_task(target: String, kind: JobKind) -> Task {
    Task::local(format!("Plan {} {}", kind, target), move |d: &mut Dispatcher| {
        d.plan_job(&target, kind)
    })
}

fn on_servers(d: &mut Dispatcher, reply: &Request) {
    if let Some(openers) = reply.result::<u8>("openers") {
        d.registry.ports_updated(openers);
    }
    let servers: Vec<NodeUpdate> = reply.result("servers").unwrap_or_default();
    for server in &servers {
        d.observe(server);
    }
    info!(
        servers = servers.len(),
        usable = d.registry().usable().len(),
        rootable = d.registry().rootable().len(),
        "Node graph refreshed"
    );
}

fn on_server_details(d: &mut Dispatcher, reply: &Request) {
    if let Some(server) = reply.result::<NodeUpdate>("server") {
        d.observe(&server);
    }
}

fn on_root(d: &mut Dispatcher, reply: &Request) {
    d.rooting = None;
    if let Some(openers) = reply.result::<u8>("openers") {
        d.registry.ports_updated(openers);
    }
    let Some(host) = reply.target.clone() else {
        return;
    };
    if reply.result::<bool>("rooted").unwrap_or(false) {
        if d.registry.rooted(&host) == Some(NodeClass::Usable) {
            let capacity = d.registry.max_ram(&host);
            d.pool.add_node(host.clone(), capacity);
        }
        info!(host = %host, "Rooted server");
    } else {
        d.registry.root_failed(&host);
        warn!(host = %host, "Could not root server");
    }
    d.root_next();
}

fn on_constants(d: &mut Dispatcher, reply: &Request) {
    if let Some(constants) = reply.result::<HackConstants>("constants") {
        info!(
            weaken = constants.sec_per_weaken,
            grow = constants.sec_per_grow,
            hack = constants.sec_per_hack,
            "Loaded hack constants"
        );
        d.hack_constants = Some(constants);
    }
}

fn on_plan(d: &mut Dispatcher, reply: &Request) {
    let reply = reply.clone();
    if !d.idle.is_empty() {
        d.reclaim_pending = true;
    }
    d.enqueue(
        Task::local(format!("Start {}", reply.label), move |d: &mut Dispatcher| {
            d.start_job(&reply)
        }),
        Priority::High,
    );
}

fn on_job_finished(_d: &mut Dispatcher, reply: &Request) {
    info!(
        job_id = ?reply.id,
        job = %reply.label,
        money = reply.result::<f64>("money").unwrap_or(0.0),
        "Job finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Step;
    use async_trait::async_trait;
    use ramlet_core::{DaemonConfig, Message, Status, TaskId};
    use ramlet_runtime::{ProcessContext, Program, RpcContext, Runtime, SimRuntime};
    use std::sync::Arc;
    use std::time::Duration;

    struct Reply(serde_json::Value);

    #[async_trait]
    impl Program for Reply {
        async fn run(&self, ctx: ProcessContext) {
            if let Some(mut rpc) = RpcContext::parse_or_warn(&ctx) {
                if let Some(results) = self.0.as_object() {
                    for (key, value) in results {
                        rpc.set_result(key, value);
                    }
                }
                rpc.exit().await;
            }
        }
    }

    fn node(host: &str, rooted: bool, ram: f64) -> NodeUpdate {
        NodeUpdate {
            hostname: host.into(),
            level: Some(1),
            ports: Some(0),
            max_ram: Some(ram),
            root_access: Some(rooted),
            ..NodeUpdate::default()
        }
    }

    fn setup() -> (Arc<SimRuntime>, Dispatcher) {
        let mut config = DaemonConfig::default();
        config.pool.home_baseline = 0.0;
        let runtime = SimRuntime::new(16, Duration::from_millis(10));
        runtime.add_node("home", 64.0);
        runtime.register("rpc/weaken", 2.0, Arc::new(Reply(serde_json::json!({}))));
        let mut dispatcher = Dispatcher::new(&config, runtime.clone()).unwrap();
        dispatcher.install_handlers();
        (runtime, dispatcher)
    }

    fn reply(event: &str, results: serde_json::Value) -> Request {
        let mut request = Request::action(event, event);
        request.status = Some(Status::Completed);
        if let Some(map) = results.as_object() {
            request.results = map.clone();
        }
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_fills_registry_and_pool() {
        let (_, mut dispatcher) = setup();
        let servers = vec![node("home", true, 64.0), node("n00dles", false, 4.0)];
        dispatcher.handle_message(Message::Reply(reply(
            "get-all-servers",
            serde_json::json!({ "servers": servers }),
        )));
        assert_eq!(dispatcher.pool().free("home"), 64.0);
        assert!(!dispatcher.pool().contains("n00dles"));
        assert_eq!(dispatcher.registry().rootable(), vec!["n00dles"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_seeds_port_openers() {
        let (_, mut dispatcher) = setup();
        let mut guarded = node("sigma", false, 16.0);
        guarded.ports = Some(2);
        dispatcher.observe(&guarded);
        assert_eq!(dispatcher.registry().next_root_target(), None);

        dispatcher.handle_message(Message::Reply(reply(
            "get-all-servers",
            serde_json::json!({ "servers": [node("home", true, 64.0), guarded], "openers": 2 }),
        )));
        assert_eq!(dispatcher.registry().openers(), 2);
        assert_eq!(dispatcher.registry().rootable(), vec!["sigma"]);
        assert!(matches!(dispatcher.root_next(), TaskOutcome::Success));
        assert_eq!(dispatcher.rooting.as_deref(), Some("sigma"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_reply_adds_node_and_chains() {
        let (_, mut dispatcher) = setup();
        for host in ["home", "n00dles", "sigma"] {
            dispatcher.observe(&node(host, host == "home", 16.0));
        }
        assert!(matches!(dispatcher.root_next(), TaskOutcome::Success));
        assert_eq!(dispatcher.queued(Priority::Normal), 1);
        assert!(matches!(dispatcher.root_next(), TaskOutcome::Success));
        assert_eq!(dispatcher.queued(Priority::Normal), 1);

        let mut rooted = reply("root-server", serde_json::json!({ "rooted": true, "openers": 0 }));
        rooted.target = Some("n00dles".into());
        dispatcher.handle_message(Message::Reply(rooted));
        assert!(dispatcher.pool().contains("n00dles"));
        assert_eq!(dispatcher.rooting.as_deref(), Some("sigma"));
        assert_eq!(dispatcher.queued(Priority::Normal), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_constants_loaded() {
        let (_, mut dispatcher) = setup();
        let constants = HackConstants::default();
        dispatcher.handle_message(Message::Reply(reply(
            "hack-constants",
            serde_json::json!({ "constants": constants }),
        )));
        assert_eq!(dispatcher.hack_constants(), Some(constants));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_uses_budget() {
        let (_, mut dispatcher) = setup();
        dispatcher.plan_job("n00dles", JobKind::Weaken);
        assert_eq!(dispatcher.queued(Priority::Normal), 0);

        dispatcher.observe(&node("home", true, 64.0));
        dispatcher.plan_job("n00dles", JobKind::Weaken);
        assert_eq!(dispatcher.queued(Priority::Normal), 1);
        assert!(dispatcher.is_pending("weaken-threads"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_planning_reply_creates_reserved_job() {
        let (_, mut dispatcher) = setup();
        dispatcher.observe(&node("home", true, 64.0));
        let plan = ThreadPlan {
            weaken: 40,
            total: 40,
            sub_total: 40,
            count: 1,
            ..ThreadPlan::default()
        };
        let mut planned = reply(
            "weaken-threads",
            serde_json::json!({ "plan": plan, "min_security": 1.0, "max_money": 70000.0 }),
        );
        planned.target = Some("n00dles".into());
        dispatcher.handle_message(Message::Reply(planned));
        assert_eq!(dispatcher.queued(Priority::High), 1);

        assert_eq!(dispatcher.step().await, Step::High);
        let job_id = dispatcher.in_flight_ids()[0];
        let job = dispatcher.in_flight(job_id).unwrap();
        assert_eq!(job.pid, None);
        assert_eq!(job.request.threads, 32);
        assert_eq!(dispatcher.pool().free("home"), 0.0);
        assert!(dispatcher.is_pending(JOB_SERVER));

        let mut finished = reply(JOB_FINISHED, serde_json::json!({}));
        finished.id = Some(job_id);
        dispatcher.handle_message(Message::Reply(finished));
        assert_eq!(dispatcher.pool().free("home"), 64.0);
        assert!(dispatcher.in_flight(TaskId(job_id.0)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_queues_discovery_first() {
        let (runtime, mut dispatcher) = setup();
        runtime.register(
            "rpc/get-all-servers",
            1.0,
            Arc::new(Reply(serde_json::json!({ "servers": [node("home", true, 64.0)] }))),
        );
        dispatcher.bootstrap();
        dispatcher.observe(&node("home", true, 64.0));
        assert_eq!(dispatcher.queued(Priority::High), 1);
        assert_eq!(dispatcher.step().await, Step::High);
        while dispatcher.step().await != Step::Message {}
        assert_eq!(dispatcher.queued(Priority::Normal), 2);
        assert!(runtime.running("rpc/get-all-servers").is_empty());
        assert_eq!(runtime.used_ram("home"), 0.0);
        assert!(!runtime.is_running(ramlet_core::Pid(1)).await);
    }
}
