use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Scheduled => write!(f, "scheduled"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTimings {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCosts {
    pub tokens: u64,
    pub usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RunErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// One unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: Uuid,
    pub agent_id: String,
    pub version: String,
    pub input: String,
    #[serde(default)]
    pub constraints: HashMap<String, String>,
    pub node_id: Option<String>,
    pub status: RunStatus,
    pub timings: RunTimings,
    pub costs: RunCosts,
    pub output: Option<String>,
    pub error_info: Option<RunErrorInfo>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(agent_id: impl Into<String>, version: impl Into<String>, input: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            version: version.into(),
            input,
            constraints: HashMap::new(),
            node_id: None,
            status: RunStatus::Pending,
            timings: RunTimings::default(),
            costs: RunCosts::default(),
            output: None,
            error_info: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_constraints(mut self, constraints: HashMap<String, String>) -> Self {
        self.constraints = constraints;
        self
    }

    fn guard(&self, to: RunStatus, allowed_from: &[RunStatus]) -> Result<()> {
        if self.status.is_terminal() {
            return Err(FleetError::RunTerminal {
                run_id: self.run_id,
                status: self.status,
            });
        }
        if !allowed_from.contains(&self.status) {
            return Err(FleetError::InvalidTransition {
                run_id: self.run_id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Bind the run to a node: `pending -> scheduled`.
    pub fn schedule(&mut self, node_id: String) -> Result<()> {
        self.guard(RunStatus::Scheduled, &[RunStatus::Pending])?;
        self.node_id = Some(node_id);
        self.status = RunStatus::Scheduled;
        self.timings.scheduled_at = Some(Utc::now());
        Ok(())
    }

    /// The assigned worker acknowledged the lease: `scheduled -> running`.
    pub fn start(&mut self) -> Result<()> {
        self.guard(RunStatus::Running, &[RunStatus::Scheduled])?;
        self.status = RunStatus::Running;
        self.timings.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, output: Option<String>, costs: RunCosts) -> Result<()> {
        self.guard(
            RunStatus::Completed,
            &[RunStatus::Scheduled, RunStatus::Running],
        )?;
        self.status = RunStatus::Completed;
        self.output = output;
        self.costs = costs;
        self.timings.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: RunErrorInfo, costs: RunCosts) -> Result<()> {
        self.guard(RunStatus::Failed, &[RunStatus::Scheduled, RunStatus::Running])?;
        self.status = RunStatus::Failed;
        self.error_info = Some(error);
        self.costs = costs;
        self.timings.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.guard(
            RunStatus::Cancelled,
            &[RunStatus::Pending, RunStatus::Scheduled, RunStatus::Running],
        )?;
        self.status = RunStatus::Cancelled;
        self.timings.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Release the run from a node that went away so it can be placed again.
    pub fn requeue(&mut self) -> Result<()> {
        self.guard(
            RunStatus::Pending,
            &[RunStatus::Scheduled, RunStatus::Running],
        )?;
        self.node_id = None;
        self.status = RunStatus::Pending;
        self.timings = RunTimings::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new("summarizer", "1", "hello".to_string())
    }

    #[test]
    fn new_run_is_pending_and_unassigned() {
        let r = run();
        assert_eq!(r.status, RunStatus::Pending);
        assert!(r.node_id.is_none());
        assert!(r.timings.scheduled_at.is_none());
    }

    #[test]
    fn happy_path_transitions() {
        let mut r = run();
        r.schedule("node-2".to_string()).unwrap();
        assert_eq!(r.status, RunStatus::Scheduled);
        assert_eq!(r.node_id.as_deref(), Some("node-2"));
        r.start().unwrap();
        r.complete(
            Some("ok".to_string()),
            RunCosts {
                tokens: 12,
                usd: 0.5,
            },
        )
        .unwrap();
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.costs.tokens, 12);
        assert!(r.timings.finished_at.is_some());
    }

    #[test]
    fn terminal_runs_are_immutable() {
        let mut r = run();
        r.cancel().unwrap();
        let err = r.schedule("node-1".to_string()).unwrap_err();
        assert!(matches!(
            err,
            FleetError::RunTerminal {
                status: RunStatus::Cancelled,
                ..
            }
        ));
        assert!(r.cancel().is_err());
        assert!(r.fail(RunErrorInfo::new("x"), RunCosts::default()).is_err());
        assert_eq!(r.status, RunStatus::Cancelled);
    }

    #[test]
    fn cannot_start_unscheduled_run() {
        let mut r = run();
        let err = r.start().unwrap_err();
        assert!(matches!(
            err,
            FleetError::InvalidTransition {
                from: RunStatus::Pending,
                to: RunStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn requeue_clears_assignment() {
        let mut r = run();
        r.schedule("node-1".to_string()).unwrap();
        r.start().unwrap();
        r.requeue().unwrap();
        assert_eq!(r.status, RunStatus::Pending);
        assert!(r.node_id.is_none());
        assert!(r.timings.started_at.is_none());
    }

    #[test]
    fn status_display() {
        assert_eq!(RunStatus::Scheduled.to_string(), "scheduled");
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
