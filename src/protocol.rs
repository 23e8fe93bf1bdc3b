//! JSON bodies exchanged between workers, operators and the control plane.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentExecutionResult, AgentSpec};
use crate::scheduler::NodeCapacity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub agent_id: String,
    pub version: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub constraints: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub node_id: String,
    pub wait_ms: u64,
}

/// A run handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub run_id: Uuid,
    pub agent_spec: AgentSpec,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRunRequest {
    /// Node reporting the outcome; must still hold the lease.
    pub node_id: String,
    pub output: Option<String>,
    pub tokens: u64,
    pub usd_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRunRequest {
    pub node_id: String,
    pub error: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub usd_cost: f64,
}

/// What a worker reports when a lease ends.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(CompleteRunRequest),
    Failed(FailRunRequest),
}

impl RunOutcome {
    pub fn failed(node_id: &str, error: impl Into<String>) -> Self {
        RunOutcome::Failed(FailRunRequest {
            node_id: node_id.to_string(),
            error: error.into(),
            ..Default::default()
        })
    }

    /// Outcome of an execution that ran on `node_id`.
    pub fn from_result(node_id: &str, result: &AgentExecutionResult) -> Self {
        if result.success {
            RunOutcome::Completed(CompleteRunRequest {
                node_id: node_id.to_string(),
                output: result.output.clone(),
                tokens: result.total_tokens(),
                usd_cost: result.usd_cost,
            })
        } else {
            RunOutcome::Failed(FailRunRequest {
                node_id: node_id.to_string(),
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Execution failed".to_string()),
                code: result.metadata.get("exitCode").cloned(),
                tokens: result.total_tokens(),
                usd_cost: result.usd_cost,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn outcome_from_success() {
        let result = AgentExecutionResult::success("answer", Duration::ZERO).with_usage(5, 6, 0.1);
        assert_eq!(
            RunOutcome::from_result("node-1", &result),
            RunOutcome::Completed(CompleteRunRequest {
                node_id: "node-1".to_string(),
                output: Some("answer".to_string()),
                tokens: 11,
                usd_cost: 0.1,
            })
        );
    }

    #[test]
    fn outcome_from_failure_keeps_exit_code() {
        let result =
            AgentExecutionResult::failure("crashed", Duration::ZERO).with_metadata("exitCode", "137");
        match RunOutcome::from_result("node-2", &result) {
            RunOutcome::Failed(fail) => {
                assert_eq!(fail.node_id, "node-2");
                assert_eq!(fail.error, "crashed");
                assert_eq!(fail.code.as_deref(), Some("137"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn assignment_wire_shape() {
        let assignment = Assignment {
            run_id: Uuid::nil(),
            agent_spec: AgentSpec::new("a", "1", Default::default()),
            input: "x".to_string(),
        };
        let json = serde_json::to_value(&assignment).unwrap();
        assert!(json.get("runId").is_some());
        assert_eq!(json["agentSpec"]["agentId"], "a");
    }
}
