use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scheduler::node::Node;
use crate::scheduler::registry::FleetRegistry;
use crate::scheduler::run::Run;

/// Read-only view of one node's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLoad {
    pub total_slots: u32,
    pub available_slots: u32,
    pub has_capacity: bool,
}

/// Places runs on the viable node with the most free slots.
#[derive(Debug, Clone)]
pub struct LeastLoadedScheduler {
    registry: Arc<FleetRegistry>,
}

impl LeastLoadedScheduler {
    pub fn new(registry: Arc<FleetRegistry>) -> Self {
        Self { registry }
    }

    /// Pick a node without touching any run.
    ///
    /// Candidates are viable nodes whose metadata matches every constraint.
    /// The one with the most available slots wins; ties go to the lowest id.
    pub fn select_node(&self, constraints: &HashMap<String, String>) -> Option<String> {
        pick_least_loaded(&self.registry.list(), constraints)
    }

    /// Assign `run` to a node, moving it to `scheduled`.
    ///
    /// `None` means no node can take the run right now; the caller retries on
    /// its own cadence. When `constraints` is `None` the run's own constraints
    /// apply.
    pub fn schedule_run(
        &self,
        run: &mut Run,
        constraints: Option<&HashMap<String, String>>,
    ) -> Option<String> {
        let node_id = self.select_node(constraints.unwrap_or(&run.constraints))?;

        if let Err(e) = run.schedule(node_id.clone()) {
            tracing::warn!(run_id = %run.run_id, error = %e, "Run cannot be scheduled");
            return None;
        }
        tracing::info!(run_id = %run.run_id, node_id = %node_id, "Run scheduled");
        Some(node_id)
    }

    pub fn get_node_load(&self) -> BTreeMap<String, NodeLoad> {
        self.registry
            .list()
            .into_iter()
            .map(|node| {
                let load = NodeLoad {
                    total_slots: node.capacity.total_slots,
                    available_slots: node.status.available_slots,
                    has_capacity: node.is_viable(),
                };
                (node.node_id, load)
            })
            .collect()
    }
}

fn pick_least_loaded(nodes: &[Node], constraints: &HashMap<String, String>) -> Option<String> {
    nodes
        .iter()
        .filter(|n| n.is_viable() && n.matches(constraints))
        .max_by(|a, b| {
            a.status
                .available_slots
                .cmp(&b.status.available_slots)
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        .map(|n| n.node_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::node::{NodeCapacity, NodeStatus};

    fn node(id: &str, total: u32, available: u32) -> Node {
        let mut n = Node::new(
            id.to_string(),
            NodeCapacity { total_slots: total },
            HashMap::new(),
        );
        n.apply_status(NodeStatus::active(total - available, available));
        n
    }

    #[test]
    fn picks_most_available() {
        let nodes = vec![node("a", 4, 1), node("b", 4, 3), node("c", 4, 2)];
        assert_eq!(
            pick_least_loaded(&nodes, &HashMap::new()).as_deref(),
            Some("b")
        );
    }

    #[test]
    fn ties_break_to_lowest_id() {
        let nodes = vec![node("node-3", 4, 2), node("node-1", 4, 2), node("node-2", 4, 2)];
        assert_eq!(
            pick_least_loaded(&nodes, &HashMap::new()).as_deref(),
            Some("node-1")
        );
    }

    #[test]
    fn full_nodes_are_skipped() {
        let nodes = vec![node("a", 4, 0), node("b", 4, 0)];
        assert!(pick_least_loaded(&nodes, &HashMap::new()).is_none());
    }
}
