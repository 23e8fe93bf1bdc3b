use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::scheduler::node::{Node, NodeCapacity, NodeStatus};

/// Authoritative map of node id to node state.
///
/// Nodes are created by registration, updated by heartbeats and never removed;
/// a node that goes away is only marked failed.
#[derive(Debug, Default)]
pub struct FleetRegistry {
    nodes: DashMap<String, Node>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert. Re-registering refreshes capacity and metadata and
    /// brings a failed node back to active.
    pub fn register(
        &self,
        node_id: &str,
        capacity: NodeCapacity,
        metadata: HashMap<String, String>,
    ) -> Node {
        let node = self
            .nodes
            .entry(node_id.to_string())
            .and_modify(|node| {
                let active_runs = node.status.active_runs.min(capacity.total_slots);
                node.capacity = capacity;
                node.metadata = metadata.clone();
                node.apply_status(NodeStatus::active(
                    active_runs,
                    capacity.total_slots - active_runs,
                ));
            })
            .or_insert_with(|| Node::new(node_id.to_string(), capacity, metadata.clone()))
            .clone();

        tracing::info!(
            node_id,
            total_slots = capacity.total_slots,
            "Node registered"
        );
        node
    }

    /// Record a heartbeat. Returns `None` for nodes that never registered.
    pub fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Option<Node> {
        let mut node = self.nodes.get_mut(node_id)?;
        node.apply_status(status);
        tracing::debug!(
            node_id,
            state = %node.status.state,
            available_slots = node.status.available_slots,
            "Heartbeat"
        );
        Some(node.clone())
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// All nodes, ordered by id.
    pub fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Take one slot on `node_id` for a placement made since its last heartbeat.
    pub fn debit_slot(&self, node_id: &str) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.debit_slot();
        }
    }

    /// Mark a node failed. Returns true if it was not already failed.
    pub fn mark_failed(&self, node_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut node) if !node.is_failed() => {
                node.mark_failed();
                true
            }
            _ => false,
        }
    }

    /// Mark every active node whose last heartbeat is older than `window` as
    /// failed. Returns the ids that changed state.
    pub fn sweep_stale(&self, window: Duration) -> Vec<String> {
        let now = Utc::now();
        let window =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::max_value());
        let mut failed = Vec::new();

        for mut node in self.nodes.iter_mut() {
            if !node.is_failed() && now - node.heartbeat_at > window {
                node.mark_failed();
                tracing::warn!(
                    node_id = %node.node_id,
                    last_heartbeat = %node.heartbeat_at,
                    "Node heartbeat stale, marking failed"
                );
                failed.push(node.node_id.clone());
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::node::NodeState;

    fn caps(total_slots: u32) -> NodeCapacity {
        NodeCapacity { total_slots }
    }

    #[test]
    fn register_is_idempotent() {
        let registry = FleetRegistry::new();
        registry.register("node-1", caps(4), HashMap::new());
        let node = registry.register(
            "node-1",
            caps(8),
            HashMap::from([("region".to_string(), "us".to_string())]),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(node.capacity.total_slots, 8);
        assert_eq!(node.status.available_slots, 8);
        assert_eq!(node.metadata.get("region").map(String::as_str), Some("us"));
    }

    #[test]
    fn register_revives_failed_node() {
        let registry = FleetRegistry::new();
        registry.register("node-1", caps(2), HashMap::new());
        assert!(registry.mark_failed("node-1"));
        let node = registry.register("node-1", caps(2), HashMap::new());
        assert_eq!(node.status.state, NodeState::Active);
    }

    #[test]
    fn heartbeat_unknown_node_returns_none() {
        let registry = FleetRegistry::new();
        assert!(registry.heartbeat("ghost", NodeStatus::active(0, 1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn heartbeat_reflects_latest_report() {
        let registry = FleetRegistry::new();
        registry.register("node-1", caps(4), HashMap::new());
        registry.heartbeat("node-1", NodeStatus::active(1, 3));
        let node = registry.heartbeat("node-1", NodeStatus::active(3, 1)).unwrap();
        assert_eq!(node.status.available_slots, 1);
        assert_eq!(registry.get("node-1").unwrap().status.active_runs, 3);
    }

    #[test]
    fn mark_failed_reports_transition_once() {
        let registry = FleetRegistry::new();
        registry.register("node-1", caps(4), HashMap::new());
        assert!(registry.mark_failed("node-1"));
        assert!(!registry.mark_failed("node-1"));
        assert!(!registry.mark_failed("ghost"));
    }

    #[test]
    fn sweep_marks_only_stale_nodes() {
        let registry = FleetRegistry::new();
        registry.register("node-1", caps(4), HashMap::new());
        std::thread::sleep(Duration::from_millis(60));
        registry.register("node-2", caps(4), HashMap::new());

        let failed = registry.sweep_stale(Duration::from_millis(40));
        assert_eq!(failed, vec!["node-1".to_string()]);
        assert!(registry.get("node-1").unwrap().is_failed());
        assert!(!registry.get("node-2").unwrap().is_failed());

        // Already failed nodes are not reported again.
        assert!(registry.sweep_stale(Duration::from_millis(40)).is_empty());
    }

    #[test]
    fn list_is_sorted() {
        let registry = FleetRegistry::new();
        for id in ["node-3", "node-1", "node-2"] {
            registry.register(id, caps(1), HashMap::new());
        }
        let ids: Vec<String> = registry.list().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["node-1", "node-2", "node-3"]);
    }
}
