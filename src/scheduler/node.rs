use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => write!(f, "active"),
            NodeState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    pub total_slots: u32,
}

/// Live state reported by a worker on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub state: NodeState,
    pub active_runs: u32,
    pub available_slots: u32,
}

impl NodeStatus {
    pub fn active(active_runs: u32, available_slots: u32) -> Self {
        Self {
            state: NodeState::Active,
            active_runs,
            available_slots,
        }
    }

    pub fn failed() -> Self {
        Self {
            state: NodeState::Failed,
            active_runs: 0,
            available_slots: 0,
        }
    }
}

/// A worker process with bounded execution capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub capacity: NodeCapacity,
    pub status: NodeStatus,
    pub metadata: HashMap<String, String>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Node {
    /// A freshly registered node starts active with every slot free.
    pub fn new(node_id: String, capacity: NodeCapacity, metadata: HashMap<String, String>) -> Self {
        Self {
            node_id,
            status: NodeStatus::active(0, capacity.total_slots),
            capacity,
            metadata,
            heartbeat_at: Utc::now(),
        }
    }

    /// Apply a heartbeat report. `available_slots` is clamped to `[0, total_slots]`.
    pub fn apply_status(&mut self, status: NodeStatus) {
        self.status = NodeStatus {
            available_slots: status.available_slots.min(self.capacity.total_slots),
            ..status
        };
        self.heartbeat_at = Utc::now();
    }

    /// Take one slot for a run placed since the last heartbeat.
    pub fn debit_slot(&mut self) {
        self.status.available_slots = self.status.available_slots.saturating_sub(1);
        self.status.active_runs = self
            .status
            .active_runs
            .saturating_add(1)
            .min(self.capacity.total_slots);
    }

    pub fn mark_failed(&mut self) {
        self.status.state = NodeState::Failed;
    }

    pub fn is_failed(&self) -> bool {
        self.status.state == NodeState::Failed
    }

    /// Eligible for placement: not failed and at least one free slot.
    pub fn is_viable(&self) -> bool {
        !self.is_failed() && self.status.available_slots > 0
    }

    /// Exact key/value match of every constraint against this node's metadata.
    pub fn matches(&self, constraints: &HashMap<String, String>) -> bool {
        constraints
            .iter()
            .all(|(key, value)| self.metadata.get(key) == Some(value))
    }
}
