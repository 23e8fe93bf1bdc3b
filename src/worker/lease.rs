use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::AgentExecutor;
use crate::client::LeaseClient;
use crate::config::WorkerConfig;
use crate::connector::RetryPolicy;
use crate::error::FleetError;
use crate::protocol::{Assignment, RunOutcome};
use crate::worker::NodeCapacityTracker;

/// Attempts made to deliver an outcome before giving up on it.
const REPORT_ATTEMPTS: u32 = 5;

/// Pulls assignments from the control plane and executes them.
///
/// The loop only pulls while the [`NodeCapacityTracker`] has a free slot.
/// For each assignment it takes a slot, acknowledges, executes on a tracked
/// task, reports the outcome and releases the slot. On shutdown it stops
/// pulling and gives in-flight runs up to the drain timeout before cancelling
/// them.
pub struct LeaseLoop {
    node_id: String,
    client: Arc<dyn LeaseClient>,
    executor: Arc<dyn AgentExecutor>,
    tracker: Arc<NodeCapacityTracker>,
    pull_wait: Duration,
    drain_timeout: Duration,
    reconnect: RetryPolicy,
    report_retry: Arc<RetryPolicy>,
    tasks: TaskTracker,
    exec_cancel: CancellationToken,
}

impl LeaseLoop {
    pub fn new(
        config: &WorkerConfig,
        client: Arc<dyn LeaseClient>,
        executor: Arc<dyn AgentExecutor>,
        tracker: Arc<NodeCapacityTracker>,
    ) -> Self {
        let report_retry = RetryPolicy::new(
            REPORT_ATTEMPTS - 1,
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
        .with_jitter(true);

        Self {
            node_id: config.node_id.clone(),
            client,
            executor,
            tracker,
            pull_wait: config.pull_wait(),
            drain_timeout: config.drain_timeout(),
            reconnect: config.reconnect_policy(),
            report_retry: Arc::new(report_retry),
            tasks: TaskTracker::new(),
            exec_cancel: CancellationToken::new(),
        }
    }

    /// Number of runs currently executing.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(node_id = %self.node_id, "Lease loop started");
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tracker.wait_for_slot() => {}
            }

            let pulled = tokio::select! {
                _ = shutdown.cancelled() => break,
                pulled = self.client.pull(&self.node_id, self.pull_wait) => pulled,
            };

            match pulled {
                Ok(Some(assignment)) => {
                    failures = 0;
                    self.dispatch(assignment).await;
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.reconnect.delay_for(failures);
                    tracing::warn!(
                        node_id = %self.node_id,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Lease pull failed, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.drain().await;
        tracing::info!(node_id = %self.node_id, "Lease loop stopped");
    }

    async fn drain(&self) {
        self.tracker.begin_drain();
        self.tasks.close();
        if self.tasks.is_empty() {
            return;
        }

        tracing::info!(
            node_id = %self.node_id,
            in_flight = self.tasks.len(),
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "Draining in-flight runs"
        );
        if tokio::time::timeout(self.drain_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                node_id = %self.node_id,
                in_flight = self.tasks.len(),
                "Drain timeout reached, cancelling remaining runs"
            );
            self.exec_cancel.cancel();
            self.tasks.wait().await;
        }
    }

    async fn dispatch(&self, assignment: Assignment) {
        let run_id = assignment.run_id;

        if !self.tracker.increment_active_leases() {
            // The control plane requeues leases that are never acknowledged.
            tracing::warn!(run_id = %run_id, node_id = %self.node_id, "No free slot, leaving lease unacknowledged");
            return;
        }

        if let Err(e) = self.client.ack(run_id, &self.node_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "Lease acknowledgement rejected");
            self.tracker.decrement_active_leases();
            return;
        }

        let client = self.client.clone();
        let executor = self.executor.clone();
        let tracker = self.tracker.clone();
        let report_retry = self.report_retry.clone();
        let cancel = self.exec_cancel.child_token();
        let node_id = self.node_id.clone();

        self.tasks.spawn(async move {
            tracing::info!(run_id = %run_id, node_id = %node_id, agent_id = %assignment.agent_spec.agent_id, "Executing run");

            let executed = AssertUnwindSafe(executor.execute(
                &assignment.agent_spec,
                &assignment.input,
                &cancel,
            ))
            .catch_unwind()
            .await;

            let outcome = match executed {
                Ok(Ok(result)) => RunOutcome::from_result(&node_id, &result),
                Ok(Err(e)) if e.is_cancelled() => {
                    RunOutcome::failed(&node_id, "Execution cancelled during worker shutdown")
                }
                Ok(Err(e)) => RunOutcome::failed(&node_id, e.to_string()),
                Err(_) => {
                    tracing::error!(run_id = %run_id, "Executor panicked");
                    RunOutcome::failed(&node_id, "Executor panicked")
                }
            };

            report_outcome(client.as_ref(), &report_retry, run_id, &outcome).await;
            tracker.decrement_active_leases();
        });
    }
}

/// Deliver `outcome`, retrying transport failures. A rejection by the control
/// plane (for example a run cancelled meanwhile) is final.
async fn report_outcome(
    client: &dyn LeaseClient,
    policy: &RetryPolicy,
    run_id: uuid::Uuid,
    outcome: &RunOutcome,
) {
    let mut attempt = 1;
    loop {
        match client.report(run_id, outcome).await {
            Ok(()) => {
                tracing::info!(run_id = %run_id, completed = matches!(outcome, RunOutcome::Completed(_)), "Outcome reported");
                return;
            }
            Err(FleetError::Rejected(reason)) => {
                tracing::warn!(run_id = %run_id, reason = %reason, "Outcome rejected by control plane");
                return;
            }
            Err(e) if attempt >= policy.max_attempts() => {
                tracing::error!(run_id = %run_id, error = %e, attempts = attempt, "Giving up on outcome report");
                return;
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(run_id = %run_id, error = %e, attempt, "Outcome report failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
