//! Central dispatcher
//!
//! A single-threaded cooperative loop. Each [`Dispatcher::step`] does one
//! thing, in strict priority order: handle one inbox message, run one
//! high-priority task, run one normal-priority task, fire a due periodic
//! tick, or sleep.

use chrono::{DateTime, Utc};
use ramlet_core::{
    DaemonConfig, DispatcherConfig, HackConstants, IdCounter, JobsConfig, Message, Pid,
    PoolConfig, RamletError, Request, TaskId,
};
use ramlet_runtime::{PortReader, Runtime};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::idle::IdleWork;
use crate::pool::MemoryPool;
use crate::registry::NodeRegistry;

/// Dispatcher-side function run as a task
pub type LocalFn = Arc<dyn Fn(&mut Dispatcher) -> TaskOutcome + Send + Sync>;

/// Callback invoked for every reply of one event name
pub type Handler = Arc<dyn Fn(&mut Dispatcher, &Request) + Send + Sync>;

/// What a queued task does when it runs
#[derive(Clone)]
pub enum Task {
    /// Start a remote process for the request
    Remote(Request),
    /// Run a function on the dispatcher itself
    Local {
        label: String,
        retries: u32,
        run: LocalFn,
    },
}

impl Task {
    pub fn local(
        label: impl Into<String>,
        run: impl Fn(&mut Dispatcher) -> TaskOutcome + Send + Sync + 'static,
    ) -> Self {
        Task::Local {
            label: label.into(),
            retries: 0,
            run: Arc::new(run),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Task::Remote(request) => &request.label,
            Task::Local { label, .. } => label,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Task::Remote(request) => request.retries,
            Task::Local { retries, .. } => *retries,
        }
    }

    fn retried(self) -> Self {
        match self {
            Task::Remote(mut request) => {
                request.retries += 1;
                Task::Remote(request)
            }
            Task::Local {
                label,
                retries,
                run,
            } => Task::Local {
                label,
                retries: retries + 1,
                run,
            },
        }
    }

    /// Copy scheduled again by a periodic tick
    fn periodic_copy(&self) -> Self {
        match self {
            Task::Remote(request) => Task::Remote(request.fresh_copy()),
            Task::Local { label, run, .. } => Task::Local {
                label: label.clone(),
                retries: 0,
                run: run.clone(),
            },
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Remote(request) => f.debug_tuple("Remote").field(&request.label).finish(),
            Task::Local { label, .. } => f.debug_tuple("Local").field(label).finish(),
        }
    }
}

/// Result of running one task
#[derive(Debug)]
pub enum TaskOutcome {
    Success,
    /// Local, recoverable failure; the task goes back to the tail of its queue
    RetryLater(RamletError),
    /// The task is reported once and dropped
    Fatal(RamletError),
}

impl From<RamletError> for TaskOutcome {
    fn from(err: RamletError) -> Self {
        if err.is_recoverable() {
            TaskOutcome::RetryLater(err)
        } else {
            TaskOutcome::Fatal(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Message,
    High,
    Normal,
    Periodic,
    Idle,
}

/// Work waiting for a reply
#[derive(Debug, Clone)]
pub struct InFlight {
    pub request: Request,
    /// `None` for jobs, whose capacity is held for a job controller
    pub pid: Option<Pid>,
    pub started_at: DateTime<Utc>,
    reported: bool,
}

#[derive(Default)]
struct Periodic {
    minute: Vec<Task>,
    ten_minute: Vec<Task>,
    next_minute: Vec<Task>,
    ticks: u64,
}

/// The central scheduler
pub struct Dispatcher {
    config: DispatcherConfig,
    pub(crate) pool_config: PoolConfig,
    pub(crate) jobs_config: JobsConfig,
    pub(crate) runtime: Arc<dyn Runtime>,
    inbox: PortReader,
    pub(crate) pool: MemoryPool,
    pub(crate) registry: NodeRegistry,
    high: VecDeque<Task>,
    normal: VecDeque<Task>,
    waiting: HashMap<String, Vec<Task>>,
    handlers: HashMap<String, Handler>,
    in_flight: HashMap<TaskId, InFlight>,
    by_pid: HashMap<Pid, TaskId>,
    /// Long-running server/service name to the request running it
    running: HashMap<String, TaskId>,
    pub(crate) idle: Vec<IdleWork>,
    periodic: Periodic,
    next_tick: Instant,
    pub(crate) ids: IdCounter,
    pub(crate) hack_constants: Option<HackConstants>,
    pub(crate) rooting: Option<String>,
    /// Evict background work before the next task runs
    pub(crate) reclaim_pending: bool,
}

impl Dispatcher {
    /// Create a dispatcher reading replies from the configured inbox port
    pub fn new(config: &DaemonConfig, runtime: Arc<dyn Runtime>) -> ramlet_core::RamletResult<Self> {
        let inbox = runtime.ports().open(config.dispatcher.inbox_port)?;
        let pool = MemoryPool::with_home(config.pool.home_node.clone(), config.pool.home_baseline);

        info!(
            inbox_port = config.dispatcher.inbox_port,
            max_retries = config.dispatcher.max_retries,
            runtime = runtime.name(),
            "Dispatcher initialized"
        );

        Ok(Self {
            next_tick: Instant::now() + Duration::from_millis(config.dispatcher.first_minute_delay_ms),
            config: config.dispatcher.clone(),
            pool_config: config.pool.clone(),
            jobs_config: config.jobs.clone(),
            runtime,
            inbox,
            pool,
            registry: NodeRegistry::new(0),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            waiting: HashMap::new(),
            handlers: HashMap::new(),
            in_flight: HashMap::new(),
            by_pid: HashMap::new(),
            running: HashMap::new(),
            idle: Vec::new(),
            periodic: Periodic::default(),
            ids: IdCounter::default(),
            hack_constants: None,
            rooting: None,
            reclaim_pending: false,
        })
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut MemoryPool {
        &mut self.pool
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn hack_constants(&self) -> Option<HackConstants> {
        self.hack_constants
    }

    pub fn next_id(&mut self) -> TaskId {
        self.ids.next()
    }

    pub fn in_flight(&self, id: TaskId) -> Option<&InFlight> {
        self.in_flight.get(&id)
    }

    pub fn in_flight_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.in_flight.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn queued(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
        }
    }

    /// Request id of a running long-running server or service
    pub fn running(&self, name: &str) -> Option<TaskId> {
        self.running.get(name).copied()
    }

    /// Whether a request for `event` is queued or in flight
    pub fn is_pending(&self, event: &str) -> bool {
        let queued = |task: &Task| matches!(task, Task::Remote(request) if request.event() == event);
        self.in_flight.values().any(|entry| entry.request.event() == event)
            || self.high.iter().any(queued)
            || self.normal.iter().any(queued)
    }

    /// Register the handler for replies of one event name
    pub fn on(&mut self, event: impl Into<String>, handler: impl Fn(&mut Dispatcher, &Request) + Send + Sync + 'static) {
        self.handlers.insert(event.into(), Arc::new(handler));
    }

    pub fn enqueue(&mut self, task: Task, priority: Priority) {
        debug!(task = %task.label(), priority = ?priority, "Queued task");
        match priority {
            Priority::High => self.high.push_back(task),
            Priority::Normal => self.normal.push_back(task),
        }
    }

    /// Park a task until a reply of `event` arrives
    pub fn wait_on(&mut self, event: impl Into<String>, task: Task) {
        self.waiting.entry(event.into()).or_default().push(task);
    }

    /// Run a copy of the task on every minute tick
    pub fn every_minute(&mut self, task: Task) {
        self.periodic.minute.push(task);
    }

    /// Run a copy of the task on every ten-minute tick
    pub fn every_ten_minutes(&mut self, task: Task) {
        self.periodic.ten_minute.push(task);
    }

    /// Run the task once, on the next minute tick
    pub fn next_minute(&mut self, task: Task) {
        self.periodic.next_minute.push(task);
    }

    /// Record a request as in flight; its reservation is released on completion
    pub fn track(&mut self, request: Request, pid: Option<Pid>) -> TaskId {
        let id = match request.id {
            Some(id) => id,
            None => self.ids.next(),
        };
        let mut request = request;
        request.id = Some(id);
        if let Some(pid) = pid {
            self.by_pid.insert(pid, id);
        }
        if let Some(name) = request.kind.listen_port().map(|_| request.event().to_string()) {
            self.running.insert(name, id);
        }
        self.in_flight.insert(
            id,
            InFlight {
                request,
                pid,
                started_at: Utc::now(),
                reported: false,
            },
        );
        id
    }

    /// Run the loop forever
    pub async fn run(&mut self) {
        loop {
            self.step().await;
        }
    }

    /// One loop iteration
    pub async fn step(&mut self) -> Step {
        if let Some(message) = self.inbox.try_read() {
            self.handle_message(message);
            return Step::Message;
        }
        if self.reclaim_pending {
            self.reclaim_pending = false;
            self.reclaim_idle().await;
        }
        if let Some(task) = self.high.pop_front() {
            self.run_task(task, Priority::High).await;
            tokio::time::sleep(Duration::from_millis(self.config.loop_sleep_ms)).await;
            return Step::High;
        }
        if let Some(task) = self.normal.pop_front() {
            self.run_task(task, Priority::Normal).await;
            tokio::time::sleep(Duration::from_millis(self.config.loop_sleep_ms)).await;
            return Step::Normal;
        }
        if Instant::now() >= self.next_tick {
            self.tick().await;
            return Step::Periodic;
        }
        tokio::time::sleep(Duration::from_millis(self.config.idle_sleep_ms)).await;
        Step::Idle
    }

    async fn run_task(&mut self, task: Task, priority: Priority) {
        let outcome = match &task {
            Task::Remote(request) => self.dispatch_task(request.clone()).await,
            Task::Local { run, .. } => {
                let run = run.clone();
                run(self)
            }
        };
        match outcome {
            TaskOutcome::Success => {}
            TaskOutcome::Fatal(e) => {
                error!(task = %task.label(), error = %e, "Dropping task");
            }
            TaskOutcome::RetryLater(e) => {
                if task.retries() >= self.config.max_retries {
                    error!(
                        task = %task.label(),
                        retries = task.retries(),
                        error = %e,
                        "Retry limit reached, dropping task"
                    );
                } else {
                    warn!(task = %task.label(), retries = task.retries(), error = %e, "Task will be retried");
                    self.enqueue(task.retried(), priority);
                }
            }
        }
    }

    /// Turn a request into a remote process
    pub async fn dispatch_task(&mut self, mut request: Request) -> TaskOutcome {
        let id = *request.id.get_or_insert_with(|| self.ids.next());

        if let Some(port) = request.kind.listen_port() {
            if let Some(outcome) = self.forward_to_running(&request, port).await {
                return outcome;
            }
        }

        let program = request.kind.program();
        let Some(cost) = self.runtime.program_cost(&program) else {
            return TaskOutcome::Fatal(RamletError::ProgramMissing(program));
        };

        let mut granted = 0;
        let mut reservation = None;
        for attempt in 0..2 {
            let txn = self.pool.reserve_threads(cost, 1, id);
            if txn.is_satisfied() {
                reservation = Some(txn.commit());
                break;
            }
            granted = txn.granted();
            txn.abort();
            if attempt == 0 && self.reclaim_idle().await == 0 {
                break;
            }
        }
        let Some(reservation) = reservation else {
            return TaskOutcome::RetryLater(RamletError::CapacityUnavailable {
                requested: 1,
                granted,
            });
        };

        let host = reservation.first_host().unwrap_or_default().to_string();
        request.threads = 1;
        request.host = Some(host.clone());
        request.reserved = Some(reservation.clone());
        let arg = match serde_json::to_string(&request) {
            Ok(arg) => arg,
            Err(e) => {
                self.pool.release(id, &reservation);
                return TaskOutcome::Fatal(e.into());
            }
        };

        match self.runtime.exec(&program, &host, 1, arg).await {
            Ok(pid) => {
                request.pid = Some(pid);
                info!(task_id = %id, pid = %pid, host = %host, task = %request.label, "Dispatched task");
                self.track(request, Some(pid));
                TaskOutcome::Success
            }
            Err(e) => {
                self.pool.release(id, &reservation);
                e.into()
            }
        }
    }

    /// Hand a request to an already running server or service
    async fn forward_to_running(&mut self, request: &Request, port: u16) -> Option<TaskOutcome> {
        let name = request.event().to_string();
        let running_id = *self.running.get(&name)?;
        let pid = self.in_flight.get(&running_id).and_then(|entry| entry.pid);
        let alive = match pid {
            Some(pid) => self.runtime.is_running(pid).await,
            None => false,
        };
        if !alive {
            warn!(server = %name, task_id = %running_id, "Registered server is gone");
            self.finish_task(running_id);
            return None;
        }
        debug!(server = %name, port = port, task = %request.label, "Forwarding to running server");
        Some(match self.runtime.ports().write(port, &Message::Reply(request.clone())).await {
            Ok(()) => TaskOutcome::Success,
            Err(e) => e.into(),
        })
    }

    /// Remove a finished request and release its reservation
    pub fn finish_task(&mut self, id: TaskId) -> Option<InFlight> {
        let entry = self.in_flight.remove(&id)?;
        if let Some(pid) = entry.pid {
            self.by_pid.remove(&pid);
        }
        self.running.retain(|_, running| *running != id);
        if let Some(reservation) = &entry.request.reserved {
            self.pool.release(id, reservation);
        }
        debug!(task_id = %id, task = %entry.request.label, "Task finished");
        Some(entry)
    }

    /// React to one message from the inbox
    pub fn handle_message(&mut self, message: Message) {
        let request = match message {
            Message::Log(line) => {
                let source = line.source.map(|id| id.to_string()).unwrap_or_default();
                info!(task_id = %source, task = %line.label, "{}", line.text);
                return;
            }
            Message::Reply(request) => request,
        };

        if let Some(job_id) = request.job_id {
            debug!(job_id = %job_id, task = %request.label, "Ignoring job sub-request reply");
            return;
        }
        if let Some(id) = request.id {
            if request.is_completion() {
                self.finish_task(id);
            }
        }

        let event = request.event().to_string();
        if let Some(tasks) = self.waiting.remove(&event) {
            for task in tasks {
                self.normal.push_back(task);
            }
        }
        if let Some(handler) = self.handlers.get(&event).cloned() {
            handler(self, &request);
        }
    }

    async fn tick(&mut self) {
        self.next_tick += Duration::from_millis(self.config.minute_ms);
        self.periodic.ticks += 1;
        let ticks = self.periodic.ticks;

        let mut due: Vec<Task> = self.periodic.minute.iter().map(Task::periodic_copy).collect();
        let every = u64::from(self.config.ten_minute_every.max(1));
        if (ticks - 1) % every == 0 {
            due.extend(self.periodic.ten_minute.iter().map(Task::periodic_copy));
        }
        due.append(&mut self.periodic.next_minute);
        debug!(tick = ticks, tasks = due.len(), "Periodic tick");
        self.normal.extend(due);

        self.report_stale(Utc::now());
        self.fill_idle().await;
    }

    /// Report in-flight entries older than the configured age, once each
    pub fn report_stale(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let Some(limit) = self.config.in_flight_warn_secs else {
            return Vec::new();
        };
        let mut stale = Vec::new();
        for (id, entry) in self.in_flight.iter_mut() {
            let age = (now - entry.started_at).num_seconds();
            if !entry.reported && age >= limit as i64 {
                entry.reported = true;
                warn!(task_id = %id, task = %entry.request.label, age_secs = age, "Task has not replied");
                stale.push(*id);
            }
        }
        stale.sort();
        stale
    }

    pub(crate) fn kill_poll(&self) -> Duration {
        self.config.kill_poll()
    }
}
