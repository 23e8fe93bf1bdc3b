use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::RunStatus;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Agent not found: {agent_id}@{version}")]
    AgentNotFound { agent_id: String, version: String },

    #[error("Run {run_id} is already {status}")]
    RunTerminal { run_id: Uuid, status: RunStatus },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Run store is at capacity")]
    RunStoreFull,

    #[error("Operation cancelled")]
    Cancelled,

    /// The control plane answered with a transient failure (5xx, 408, 429).
    #[error("Lease channel error: {0}")]
    LeaseChannel(String),

    /// The control plane refused the request; repeating it will not help.
    #[error("Rejected by control plane: {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether the error is the caller asking to stop rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
