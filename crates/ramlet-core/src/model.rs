//! Request, Reservation, Message and Job type definitions

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{Pid, TaskId};

/// Port that replies go to when a request names none.
pub const DEFAULT_REPLY_PORT: u16 = 20;

/// What a request asks the environment to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// One-shot remote call, runs `rpc/<action>`
    Action(String),
    /// Long-running job server listening on `port`, runs `rpc/servers/<name>`
    Server { name: String, port: u16 },
    /// Long-running service listening on `port`, runs `rpc/services/<name>`
    Service { name: String, port: u16 },
}

impl RequestKind {
    /// Event name used for message routing and waiting tasks
    pub fn name(&self) -> &str {
        match self {
            RequestKind::Action(action) => action,
            RequestKind::Server { name, .. } => name,
            RequestKind::Service { name, .. } => name,
        }
    }

    /// Program the environment must run for this kind
    pub fn program(&self) -> String {
        match self {
            RequestKind::Action(action) => format!("rpc/{}", action),
            RequestKind::Server { name, .. } => format!("rpc/servers/{}", name),
            RequestKind::Service { name, .. } => format!("rpc/services/{}", name),
        }
    }

    /// Listening port of a long-running server or service
    pub fn listen_port(&self) -> Option<u16> {
        match self {
            RequestKind::Action(_) => None,
            RequestKind::Server { port, .. } | RequestKind::Service { port, .. } => Some(*port),
        }
    }
}

/// Reply status; an absent status means completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Completed,
    Running,
    Failed,
    /// Any status this side does not name
    #[serde(other)]
    Other,
}

/// Capacity set aside on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Node the capacity lives on
    pub host: String,
    /// Capacity reserved on that node
    pub ram: f64,
    /// Threads the capacity pays for
    #[serde(default)]
    pub threads: u32,
}

/// Capacity set aside across nodes for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(default)]
    pub total_ram: f64,
    #[serde(default)]
    pub total_threads: u32,
    #[serde(default)]
    pub hosts: Vec<Assignment>,
}

impl Reservation {
    pub fn push(&mut self, assignment: Assignment) {
        self.total_ram += assignment.ram;
        self.total_threads += assignment.threads;
        self.hosts.push(assignment);
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Node of the first assignment, where a single process is started
    pub fn first_host(&self) -> Option<&str> {
        self.hosts.first().map(|a| a.host.as_str())
    }
}

/// A unit of work dispatched to exactly one remote process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "call")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Node the process runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Milliseconds the remote program waits before acting
    #[serde(default)]
    pub delay_ms: u64,
    /// Ports replies are delivered to; empty means [`DEFAULT_REPLY_PORT`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    /// Routes the reply to a job controller sub-request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<Reservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
    #[serde(default)]
    pub retries: u32,
    /// Completion of this request starts the job's next cycle
    #[serde(default)]
    pub rearm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub results: Map<String, Value>,
}

fn default_threads() -> u32 {
    1
}

impl Request {
    pub fn new(label: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            id: None,
            label: label.into(),
            kind,
            target: None,
            host: None,
            threads: 1,
            delay_ms: 0,
            ports: Vec::new(),
            job_id: None,
            reserved: None,
            pid: None,
            retries: 0,
            rearm: false,
            status: None,
            params: Map::new(),
            results: Map::new(),
        }
    }

    /// Create a one-shot remote call
    pub fn action(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(label, RequestKind::Action(action.into()))
    }

    /// Create a request for a long-running job server
    pub fn server(label: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self::new(
            label,
            RequestKind::Server {
                name: name.into(),
                port,
            },
        )
    }

    /// Create a request for a long-running service
    pub fn service(label: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self::new(
            label,
            RequestKind::Service {
                name: name.into(),
                port,
            },
        )
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Serialize) -> Self {
        self.set_param(key, value);
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.params.insert(key.to_string(), value);
        }
    }

    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_result(&mut self, key: &str, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.results.insert(key.to_string(), value);
        }
    }

    pub fn result<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.results
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Event name of the request (action, server or service name)
    pub fn event(&self) -> &str {
        self.kind.name()
    }

    /// Absence of a status is synonymous with completed
    pub fn is_completion(&self) -> bool {
        matches!(self.status, None | Some(Status::Completed))
    }

    /// Ports a reply to this request must be delivered on
    pub fn reply_ports(&self) -> Vec<u16> {
        if self.ports.is_empty() {
            vec![DEFAULT_REPLY_PORT]
        } else {
            self.ports.clone()
        }
    }

    /// Copy used for periodic re-submission; the copy gets a new id later
    pub fn fresh_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = None;
        copy.pid = None;
        copy.reserved = None;
        copy.retries = 0;
        copy.status = None;
        copy.results.clear();
        copy
    }
}

/// Display-only text emitted by a remote program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TaskId>,
    #[serde(default)]
    pub label: String,
    pub text: String,
}

/// The only unit of cross-process data exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    /// A request coming back (or being forwarded) with result fields
    Reply(Request),
    /// Side-channel text; never a completion
    Log(LogLine),
}

impl Message {
    pub fn correlation_id(&self) -> Option<TaskId> {
        match self {
            Message::Reply(request) => request.id,
            Message::Log(line) => line.source,
        }
    }

    pub fn encode(&self) -> String {
        // Serializing these types cannot fail: every map key is a string.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// The three job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Drive security down to its minimum
    Weaken,
    /// Drive money up to its maximum
    Grow,
    /// Repeatedly extract, then restore
    Hack,
}

impl JobKind {
    /// Planning action whose reply starts a job of this kind
    pub fn planning_action(&self) -> &'static str {
        match self {
            JobKind::Weaken => "weaken-threads",
            JobKind::Grow => "grow-threads",
            JobKind::Hack => "hack-threads",
        }
    }

    pub fn from_planning_action(action: &str) -> Option<Self> {
        match action {
            "weaken-threads" => Some(JobKind::Weaken),
            "grow-threads" => Some(JobKind::Grow),
            "hack-threads" => Some(JobKind::Hack),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Weaken => write!(f, "Weaken"),
            JobKind::Grow => write!(f, "Grow"),
            JobKind::Hack => write!(f, "Hack"),
        }
    }
}

/// Thread counts for one job cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadPlan {
    /// Fraction of the target's value taken by one batch
    #[serde(default)]
    pub hack_fraction: f64,
    #[serde(default)]
    pub hack: u32,
    #[serde(default)]
    pub hack_weaken: u32,
    #[serde(default)]
    pub grow: u32,
    #[serde(default)]
    pub grow_weaken: u32,
    #[serde(default)]
    pub weaken: u32,
    /// Threads used by one batch
    #[serde(default)]
    pub sub_total: u32,
    /// Batches that fit side by side
    #[serde(default)]
    pub count: u32,
    /// Threads the whole job needs
    #[serde(default)]
    pub total: u32,
}

/// A job handed to a job controller with its slice of capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: TaskId,
    pub kind: JobKind,
    pub target: String,
    pub min_security: f64,
    pub max_money: f64,
    #[serde(default)]
    pub plan: ThreadPlan,
    #[serde(default)]
    pub reserved: Reservation,
}

/// Phase of a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    NeedsWeaken,
    NeedsGrow,
    /// Running hack batches
    Working,
    Idle,
    Done,
}

/// Per-thread effect constants reported by the environment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HackConstants {
    /// Security removed by one weaken thread
    pub sec_per_weaken: f64,
    /// Security added by one grow thread
    pub sec_per_grow: f64,
    /// Security added by one hack thread
    pub sec_per_hack: f64,
}

impl Default for HackConstants {
    fn default() -> Self {
        Self {
            sec_per_weaken: 0.05,
            sec_per_grow: 0.004,
            sec_per_hack: 0.002,
        }
    }
}

/// Node attributes reported by discovery; `None` means "not reported"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub hostname: String,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub ports: Option<u8>,
    #[serde(default)]
    pub max_ram: Option<f64>,
    #[serde(default)]
    pub max_money: Option<f64>,
    #[serde(default)]
    pub root_access: Option<bool>,
    #[serde(default)]
    pub backdoor: Option<bool>,
    #[serde(default)]
    pub purchased: Option<bool>,
    #[serde(default)]
    pub location: Option<Vec<String>>,
    #[serde(default)]
    pub links: Option<Vec<String>>,
}
