//! Configuration types for ramlet

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::JobKind;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Dispatcher loop configuration
    pub dispatcher: DispatcherConfig,
    /// Global memory pool configuration
    pub pool: PoolConfig,
    /// Job controller configuration
    pub jobs: JobsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Simulated environment
    pub world: WorldConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::RamletError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::RamletError::Config(format!("Failed to read config file: {}", e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, crate::RamletError> {
        toml::from_str(content)
            .map_err(|e| crate::RamletError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Port the dispatcher reads replies from
    pub inbox_port: u16,
    /// Capacity of every port channel
    pub channel_capacity: usize,
    /// Back-off between write attempts on a full channel
    pub write_retry_ms: u64,
    /// Sleep between loop iterations that did work
    pub loop_sleep_ms: u64,
    /// Sleep when nothing was done
    pub idle_sleep_ms: u64,
    /// Delay before the first minute tick
    pub first_minute_delay_ms: u64,
    /// Length of a minute tick
    pub minute_ms: u64,
    /// Minute ticks per ten-minute tick
    pub ten_minute_every: u32,
    /// Retry ceiling for tasks that could not start
    pub max_retries: u32,
    /// Report in-flight entries older than this
    pub in_flight_warn_secs: Option<u64>,
    /// Liveness poll interval after killing a process
    pub kill_poll_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            inbox_port: 20,
            channel_capacity: 50,
            write_retry_ms: 200,
            loop_sleep_ms: 100,
            idle_sleep_ms: 400,
            first_minute_delay_ms: 5000,
            minute_ms: 60_000,
            ten_minute_every: 10,
            max_retries: 25,
            in_flight_warn_secs: None,
            kill_poll_ms: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn write_retry(&self) -> Duration {
        Duration::from_millis(self.write_retry_ms)
    }

    pub fn kill_poll(&self) -> Duration {
        Duration::from_millis(self.kill_poll_ms)
    }
}

/// Global pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Node the dispatcher itself runs on
    pub home_node: String,
    /// Overrides the home node's capacity from the world description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_ram: Option<f64>,
    /// Capacity withheld on home for the dispatcher's own footprint
    pub home_baseline: f64,
    /// Capacity on home never filled with background work
    pub idle_home_headroom: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            home_node: "home".to_string(),
            home_ram: None,
            home_baseline: 8.0,
            idle_home_headroom: 16.0,
        }
    }
}

/// A job planned at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTarget {
    pub target: String,
    pub kind: JobKind,
}

/// Job controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Port the job server listens on
    pub server_port: u16,
    /// Spacing between completions inside one batch
    pub step_ms: u64,
    /// Extra delay on the trailing re-arming weaken
    pub rearm_delay_ms: u64,
    /// Delay of the optional re-arming wait task
    pub wait_delay_ms: u64,
    /// Starting extraction percentage of a hack plan requested without a budget
    pub hack_target_percent: f64,
    /// Upper bound of the linear optimizer scan
    pub scan_limit: u32,
    /// Iteration ceiling of the fallback binary search
    pub search_iterations: u32,
    /// Spacing between independent hack batches
    pub batch_spacing_ms: u64,
    /// Job controller loop sleep
    pub poll_ms: u64,
    /// Preemptible background program
    pub idle_program: String,
    /// Jobs planned at startup
    pub targets: Vec<JobTarget>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            server_port: 19,
            step_ms: 1000,
            rearm_delay_ms: 500,
            wait_delay_ms: 4000,
            hack_target_percent: 10.0,
            scan_limit: 500,
            search_iterations: 64,
            batch_spacing_ms: 4000,
            poll_ms: 100,
            idle_program: "idle".to_string(),
            targets: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// One node of the simulated world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub max_ram: f64,
    #[serde(default)]
    pub root_access: bool,
    #[serde(default = "default_level")]
    pub level: u32,
    /// Port openers needed to root the node
    #[serde(default)]
    pub ports: u8,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub purchased: bool,
    #[serde(default)]
    pub cores: u32,
    #[serde(default = "default_min_security")]
    pub min_security: f64,
    /// Starting security; defaults to three times the minimum
    #[serde(default)]
    pub security: Option<f64>,
    #[serde(default)]
    pub max_money: f64,
    /// Starting money; defaults to a quarter of the maximum
    #[serde(default)]
    pub money: Option<f64>,
    /// Money fraction one hack thread takes
    #[serde(default = "default_hack_fraction")]
    pub hack_fraction: f64,
    /// Hack time at minimum security
    #[serde(default = "default_hack_ms")]
    pub hack_ms: u64,
    /// Money multiplier of one grow thread
    #[serde(default = "default_growth_per_thread")]
    pub growth_per_thread: f64,
}

fn default_level() -> u32 {
    1
}

fn default_min_security() -> f64 {
    1.0
}

fn default_hack_fraction() -> f64 {
    0.002
}

fn default_hack_ms() -> u64 {
    2000
}

fn default_growth_per_thread() -> f64 {
    1.005
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, max_ram: f64) -> Self {
        Self {
            name: name.into(),
            max_ram,
            root_access: false,
            level: default_level(),
            ports: 0,
            links: Vec::new(),
            purchased: false,
            cores: 1,
            min_security: default_min_security(),
            security: None,
            max_money: 0.0,
            money: None,
            hack_fraction: default_hack_fraction(),
            hack_ms: default_hack_ms(),
            growth_per_thread: default_growth_per_thread(),
        }
    }
}

/// The simulated environment the daemon runs against
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Port openers the operator owns
    pub openers: u8,
    /// Operator level; nodes above it cannot be rooted
    pub player_level: u32,
    /// Capacity cost per thread of each program, keyed by program path
    pub program_ram: HashMap<String, f64>,
    /// Cost used for programs missing from `program_ram`
    pub default_program_ram: f64,
    pub nodes: Vec<NodeConfig>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let mut home = NodeConfig::new("home", 64.0);
        home.root_access = true;
        home.purchased = true;
        home.links = vec!["n00dles".into(), "foodnstuff".into()];

        let mut n00dles = NodeConfig::new("n00dles", 4.0);
        n00dles.max_money = 70_000.0;
        n00dles.links = vec!["home".into()];

        let mut foodnstuff = NodeConfig::new("foodnstuff", 16.0);
        foodnstuff.min_security = 3.0;
        foodnstuff.max_money = 2_000_000.0;
        foodnstuff.links = vec!["home".into(), "zer0".into()];

        let mut zer0 = NodeConfig::new("zer0", 32.0);
        zer0.level = 75;
        zer0.ports = 1;
        zer0.min_security = 8.0;
        zer0.max_money = 7_500_000.0;
        zer0.links = vec!["foodnstuff".into()];

        Self {
            openers: 0,
            player_level: 50,
            program_ram: HashMap::new(),
            default_program_ram: 1.75,
            nodes: vec![home, n00dles, foodnstuff, zer0],
        }
    }
}

impl WorldConfig {
    /// Per-thread cost of a program path
    pub fn ram_for(&self, program: &str) -> f64 {
        self.program_ram
            .get(program)
            .copied()
            .unwrap_or(self.default_program_ram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.dispatcher.inbox_port, 20);
        assert_eq!(config.dispatcher.max_retries, 25);
        assert_eq!(config.jobs.server_port, 19);
        assert_eq!(config.pool.home_node, "home");
        assert!(config.world.nodes.iter().any(|n| n.name == "home"));
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[dispatcher]
max_retries = 3
in_flight_warn_secs = 600

[jobs]
targets = [
    { target = "n00dles", kind = "weaken" },
    { target = "foodnstuff", kind = "hack" },
]

[world]
openers = 2
program_ram = { "rpc/weaken" = 1.75, "rpc/servers/jobs" = 4.1 }

[[world.nodes]]
name = "home"
max_ram = 128
root_access = true
"#;
        let config = DaemonConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.dispatcher.max_retries, 3);
        assert_eq!(config.dispatcher.in_flight_warn_secs, Some(600));
        assert_eq!(config.dispatcher.channel_capacity, 50);
        assert_eq!(config.jobs.targets.len(), 2);
        assert_eq!(config.jobs.targets[1].kind, JobKind::Hack);
        assert_eq!(config.world.openers, 2);
        assert_eq!(config.world.nodes.len(), 1);
        assert_eq!(config.world.nodes[0].level, 1);
        assert_eq!(config.world.ram_for("rpc/servers/jobs"), 4.1);
        assert_eq!(config.world.ram_for("rpc/grow"), 1.75);
    }

    #[test]
    fn test_sample_config_parses() {
        let config = DaemonConfig::from_toml(include_str!("../../../config/ramletd.toml")).unwrap();
        assert_eq!(config.jobs.targets.len(), 3);
        assert_eq!(config.world.nodes.len(), 4);
        assert_eq!(config.world.ram_for("rpc/servers/jobs"), 4.0);
        assert_eq!(config.dispatcher.in_flight_warn_secs, Some(900));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\nformat = \"json\"").unwrap();
        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_from_file_missing() {
        let err = DaemonConfig::from_file(std::path::Path::new("/nonexistent/ramletd.toml"))
            .unwrap_err();
        assert!(matches!(err, crate::RamletError::Config(_)));
    }
}
