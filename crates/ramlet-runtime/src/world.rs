//! Simulated node graph and target state

use ramlet_core::{
    HackConstants, NodeConfig, NodeUpdate, RamletError, RamletResult, WorldConfig,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::traits::{Oracle, TargetState};

#[derive(Debug, Clone)]
struct SimNode {
    config: NodeConfig,
    rooted: bool,
    security: f64,
    money: f64,
}

impl SimNode {
    fn new(config: NodeConfig) -> Self {
        let security = config.security.unwrap_or(config.min_security * 3.0);
        let money = config.money.unwrap_or(config.max_money / 4.0);
        Self {
            rooted: config.root_access,
            config,
            security,
            money,
        }
    }

    fn hack_ms(&self) -> u64 {
        let penalty = 1.0 + (self.security - self.config.min_security).max(0.0) / 20.0;
        (self.config.hack_ms as f64 * penalty).round() as u64
    }

    fn update(&self) -> NodeUpdate {
        NodeUpdate {
            hostname: self.config.name.clone(),
            level: Some(self.config.level),
            cores: Some(self.config.cores),
            ports: Some(self.config.ports),
            max_ram: Some(self.config.max_ram),
            max_money: Some(self.config.max_money),
            root_access: Some(self.rooted),
            backdoor: Some(false),
            purchased: Some(self.config.purchased),
            location: None,
            links: Some(self.config.links.clone()),
        }
    }
}

struct WorldState {
    order: Vec<String>,
    nodes: HashMap<String, SimNode>,
}

/// The simulated environment: node graph plus target economics
pub struct SimWorld {
    home: String,
    openers: u8,
    player_level: u32,
    constants: HackConstants,
    state: Mutex<WorldState>,
}

impl SimWorld {
    pub fn new(home: impl Into<String>, config: &WorldConfig) -> Self {
        let mut order = Vec::new();
        let mut nodes = HashMap::new();
        for node in &config.nodes {
            order.push(node.name.clone());
            nodes.insert(node.name.clone(), SimNode::new(node.clone()));
        }
        Self {
            home: home.into(),
            openers: config.openers,
            player_level: config.player_level,
            constants: HackConstants::default(),
            state: Mutex::new(WorldState { order, nodes }),
        }
    }

    fn state(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_node<T>(&self, host: &str, f: impl FnOnce(&mut SimNode) -> T) -> RamletResult<T> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(host)
            .ok_or_else(|| RamletError::InvalidTarget(host.to_string()))?;
        Ok(f(node))
    }

    /// Lower security by `threads` weakens; returns the amount removed
    pub fn weaken(&self, host: &str, threads: u32) -> RamletResult<f64> {
        let per_thread = self.constants.sec_per_weaken;
        self.with_node(host, |node| {
            let before = node.security;
            node.security = (node.security - per_thread * threads as f64)
                .max(node.config.min_security);
            before - node.security
        })
    }

    /// Grow money by `threads` grows; returns the multiplier achieved
    pub fn grow(&self, host: &str, threads: u32) -> RamletResult<f64> {
        let per_thread = self.constants.sec_per_grow;
        self.with_node(host, |node| {
            let before = node.money.max(1.0);
            let grown = (node.money + threads as f64)
                * node.config.growth_per_thread.powi(threads as i32);
            node.money = grown.min(node.config.max_money);
            node.security += per_thread * threads as f64;
            node.money / before
        })
    }

    /// Take money with `threads` hacks; returns the amount taken
    pub fn hack(&self, host: &str, threads: u32) -> RamletResult<f64> {
        let per_thread = self.constants.sec_per_hack;
        self.with_node(host, |node| {
            if !node.rooted {
                return 0.0;
            }
            let fraction = hack_fraction(node) * threads as f64;
            let taken = node.money * fraction.min(1.0);
            node.money -= taken;
            node.security += per_thread * threads as f64;
            taken
        })
    }
}

fn hack_fraction(node: &SimNode) -> f64 {
    let difficulty = ((100.0 - node.security) / 100.0).max(0.0);
    node.config.hack_fraction * difficulty
}

impl Oracle for SimWorld {
    fn target(&self, host: &str) -> RamletResult<TargetState> {
        self.with_node(host, |node| {
            let hack_ms = node.hack_ms();
            TargetState {
                security: node.security,
                min_security: node.config.min_security,
                money: node.money,
                max_money: node.config.max_money,
                hack_fraction: hack_fraction(node),
                hack_ms,
                grow_ms: (hack_ms as f64 * 3.2).round() as u64,
                weaken_ms: hack_ms * 4,
            }
        })
    }

    fn growth_threads(&self, host: &str, multiplier: f64) -> RamletResult<f64> {
        self.with_node(host, |node| {
            if multiplier <= 1.0 {
                0.0
            } else {
                multiplier.ln() / node.config.growth_per_thread.ln()
            }
        })
    }

    fn constants(&self) -> HackConstants {
        self.constants
    }

    fn discover(&self) -> Vec<NodeUpdate> {
        let state = self.state();
        let start = if state.nodes.contains_key(&self.home) {
            self.home.clone()
        } else {
            match state.order.first() {
                Some(first) => first.clone(),
                None => return Vec::new(),
            }
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        let mut found = Vec::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(node) = state.nodes.get(&name) {
                found.push(node.update());
                queue.extend(node.config.links.iter().cloned());
            }
        }
        found
    }

    fn details(&self, host: &str) -> RamletResult<NodeUpdate> {
        self.with_node(host, |node| node.update())
    }

    fn root(&self, host: &str) -> RamletResult<bool> {
        let openers = self.openers;
        let player_level = self.player_level;
        self.with_node(host, |node| {
            if !node.rooted && node.config.ports <= openers && node.config.level <= player_level {
                node.rooted = true;
                info!(host = %node.config.name, "Gained root access");
            }
            node.rooted
        })
    }

    fn openers(&self) -> u8 {
        self.openers
    }
}
