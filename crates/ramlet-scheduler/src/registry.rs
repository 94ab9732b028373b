//! Node registry: attributes and classification of every known node

use ramlet_core::{NodeUpdate, RamletError};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Work queue a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    /// Rooted and has capacity
    Usable,
    /// Rooted but has no capacity
    Useless,
    /// Not rooted; enough port openers to root it
    Rootable,
    /// Not rooted; needs more port openers than owned
    PortBlocked,
}

/// Result of folding one discovery record into the registry
#[derive(Debug, Clone, PartialEq)]
pub struct NodeChange {
    pub is_new: bool,
    /// Attributes of an already known node whose value changed
    pub changed: Vec<String>,
    pub class: NodeClass,
}

macro_rules! merge_field {
    ($changes:ident, $known:ident, $update:ident, $field:ident) => {
        if let Some(value) = &$update.$field {
            if $known.$field.as_ref() != Some(value) {
                if $known.$field.is_some() {
                    $changes.push(stringify!($field).to_string());
                }
                $known.$field = Some(value.clone());
            }
        }
    };
}

/// Every node ever observed; nodes are reclassified, never removed
#[derive(Debug, Default)]
pub struct NodeRegistry {
    order: Vec<String>,
    nodes: HashMap<String, NodeUpdate>,
    classes: HashMap<String, NodeClass>,
    failed_roots: HashSet<String>,
    openers: u8,
}

impl NodeRegistry {
    pub fn new(openers: u8) -> Self {
        Self {
            openers,
            ..Self::default()
        }
    }

    /// Fold a discovery record in, reclassifying the node
    pub fn update(&mut self, update: &NodeUpdate) -> NodeChange {
        let host = update.hostname.clone();
        let is_new = !self.nodes.contains_key(&host);
        if is_new {
            self.order.push(host.clone());
        }
        let known = self
            .nodes
            .entry(host.clone())
            .or_insert_with(|| NodeUpdate {
                hostname: host.clone(),
                ..NodeUpdate::default()
            });

        let mut changed = Vec::new();
        merge_field!(changed, known, update, level);
        merge_field!(changed, known, update, cores);
        merge_field!(changed, known, update, ports);
        merge_field!(changed, known, update, max_ram);
        merge_field!(changed, known, update, max_money);
        merge_field!(changed, known, update, root_access);
        merge_field!(changed, known, update, backdoor);
        merge_field!(changed, known, update, purchased);
        merge_field!(changed, known, update, location);
        merge_field!(changed, known, update, links);

        for attribute in &changed {
            let stale = RamletError::StaleNodeState {
                node: host.clone(),
                attribute: attribute.clone(),
            };
            info!(host = %host, "{}", stale);
        }
        if is_new {
            debug!(host = %host, "Discovered node");
        }

        let class = self.classify(&host);
        NodeChange {
            is_new,
            changed,
            class,
        }
    }

    fn classify(&mut self, host: &str) -> NodeClass {
        let Some(node) = self.nodes.get(host) else {
            return NodeClass::PortBlocked;
        };
        let class = if node.root_access.unwrap_or(false) {
            if node.max_ram.unwrap_or(0.0) > 0.0 {
                NodeClass::Usable
            } else {
                NodeClass::Useless
            }
        } else if node.ports.unwrap_or(0) <= self.openers {
            NodeClass::Rootable
        } else {
            NodeClass::PortBlocked
        };
        let previous = self.classes.insert(host.to_string(), class);
        if previous.is_some() && previous != Some(class) {
            info!(host = %host, class = ?class, "Reclassified node");
        }
        class
    }

    pub fn get(&self, host: &str) -> Option<&NodeUpdate> {
        self.nodes.get(host)
    }

    pub fn class(&self, host: &str) -> Option<NodeClass> {
        self.classes.get(host).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn openers(&self) -> u8 {
        self.openers
    }

    fn in_class(&self, class: NodeClass) -> Vec<String> {
        self.order
            .iter()
            .filter(|host| self.classes.get(*host) == Some(&class))
            .cloned()
            .collect()
    }

    /// Rooted nodes with capacity, in discovery order
    pub fn usable(&self) -> Vec<String> {
        self.in_class(NodeClass::Usable)
    }

    pub fn useless(&self) -> Vec<String> {
        self.in_class(NodeClass::Useless)
    }

    /// Rootable nodes, lowest level first
    pub fn rootable(&self) -> Vec<String> {
        let mut hosts = self.in_class(NodeClass::Rootable);
        hosts.sort_by_key(|host| {
            self.nodes
                .get(host)
                .and_then(|n| n.level)
                .unwrap_or(u32::MAX)
        });
        hosts
    }

    pub fn port_blocked(&self) -> Vec<String> {
        self.in_class(NodeClass::PortBlocked)
    }

    /// Capacity of a node as last reported
    pub fn max_ram(&self, host: &str) -> f64 {
        self.nodes
            .get(host)
            .and_then(|n| n.max_ram)
            .unwrap_or(0.0)
    }

    /// Record a successful root; returns the new class
    pub fn rooted(&mut self, host: &str) -> Option<NodeClass> {
        let node = self.nodes.get_mut(host)?;
        node.root_access = Some(true);
        self.failed_roots.remove(host);
        Some(self.classify(host))
    }

    /// Record a failed root attempt; the node is skipped until openers change
    pub fn root_failed(&mut self, host: &str) {
        self.failed_roots.insert(host.to_string());
    }

    /// Lowest-level rootable node not already tried
    pub fn next_root_target(&self) -> Option<String> {
        self.rootable()
            .into_iter()
            .find(|host| !self.failed_roots.contains(host))
    }

    /// New opener count; returns port-blocked nodes promoted to rootable
    pub fn ports_updated(&mut self, openers: u8) -> Vec<String> {
        if openers == self.openers {
            return Vec::new();
        }
        self.openers = openers;
        self.failed_roots.clear();
        let mut promoted = Vec::new();
        for host in self.port_blocked() {
            if self.classify(&host) == NodeClass::Rootable {
                promoted.push(host);
            }
        }
        if !promoted.is_empty() {
            info!(openers = openers, promoted = ?promoted, "Port openers unlocked nodes");
        }
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str, rooted: bool, ram: f64, ports: u8, level: u32) -> NodeUpdate {
        NodeUpdate {
            hostname: host.into(),
            level: Some(level),
            ports: Some(ports),
            max_ram: Some(ram),
            root_access: Some(rooted),
            ..NodeUpdate::default()
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new(1);
        registry.update(&node("home", true, 64.0, 0, 1));
        registry.update(&node("useless", true, 0.0, 0, 1));
        registry.update(&node("high", false, 32.0, 1, 80));
        registry.update(&node("low", false, 16.0, 0, 5));
        registry.update(&node("blocked", false, 8.0, 3, 10));
        registry.update(&node("pserv", true, 8.0, 0, 1));
        registry
    }

    #[test]
    fn test_classification() {
        let registry = registry();
        assert_eq!(registry.usable(), vec!["home", "pserv"]);
        assert_eq!(registry.useless(), vec!["useless"]);
        assert_eq!(registry.rootable(), vec!["low", "high"]);
        assert_eq!(registry.port_blocked(), vec!["blocked"]);
    }

    #[test]
    fn test_refresh_reports_changes() {
        let mut registry = registry();
        let change = registry.update(&node("home", true, 128.0, 0, 1));
        assert!(!change.is_new);
        assert_eq!(change.changed, vec!["max_ram"]);
        assert_eq!(registry.max_ram("home"), 128.0);

        let partial = NodeUpdate {
            hostname: "home".into(),
            ..NodeUpdate::default()
        };
        let change = registry.update(&partial);
        assert!(change.changed.is_empty());
        assert_eq!(change.class, NodeClass::Usable);
    }

    #[test]
    fn test_rooting_flow() {
        let mut registry = registry();
        assert_eq!(registry.next_root_target().as_deref(), Some("low"));
        assert_eq!(registry.rooted("low"), Some(NodeClass::Usable));
        assert_eq!(registry.usable(), vec!["home", "low", "pserv"]);

        assert_eq!(registry.next_root_target().as_deref(), Some("high"));
        registry.root_failed("high");
        assert_eq!(registry.next_root_target(), None);
        assert_eq!(registry.rooted("nowhere"), None);
    }

    #[test]
    fn test_ports_updated_promotes() {
        let mut registry = registry();
        registry.root_failed("high");
        assert!(registry.ports_updated(1).is_empty());
        assert_eq!(registry.ports_updated(3), vec!["blocked"]);
        assert_eq!(registry.rootable(), vec!["low", "blocked", "high"]);
        assert_eq!(registry.next_root_target().as_deref(), Some("low"));
    }
}
