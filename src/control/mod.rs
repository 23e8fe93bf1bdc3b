//! Control plane: fleet registry, run lifecycle and lease dispatch.
//!
//! # Flow
//!
//! 1. Workers register and then heartbeat their live capacity
//! 2. Operators register agent definitions and create runs (`pending`)
//! 3. The dispatch loop places pending runs with the [`LeastLoadedScheduler`]
//!    and drops an assignment in the chosen node's mailbox (`scheduled`)
//! 4. The worker long-polls its mailbox, acknowledges (`running`) and later
//!    reports `completed` or `failed`
//!
//! Nodes that stop heartbeating for longer than the staleness window are
//! marked failed and their unfinished runs go back to `pending`.

pub mod api;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentSpec;
use crate::config::ControlConfig;
use crate::error::{FleetError, Result};
use crate::protocol::Assignment;
use crate::scheduler::{
    FleetRegistry, LeastLoadedScheduler, Node, NodeCapacity, NodeLoad, NodeState, NodeStatus, Run,
    RunCosts, RunErrorInfo, RunStatus, RunStore,
};

/// Pending assignments for one node.
#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Uuid>>,
    notify: Notify,
}

impl Mailbox {
    fn push(&self, run_id: Uuid) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(run_id),
            Err(poisoned) => poisoned.into_inner().push_back(run_id),
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Uuid> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

pub struct ControlPlane {
    config: ControlConfig,
    registry: Arc<FleetRegistry>,
    runs: RunStore,
    scheduler: LeastLoadedScheduler,
    agents: DashMap<(String, String), AgentSpec>,
    mailboxes: DashMap<String, Arc<Mailbox>>,
}

impl ControlPlane {
    pub fn new(config: ControlConfig) -> Self {
        let registry = Arc::new(FleetRegistry::new());
        Self {
            scheduler: LeastLoadedScheduler::new(registry.clone()),
            registry,
            runs: RunStore::with_capacity(config.max_runs),
            config,
            agents: DashMap::new(),
            mailboxes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &LeastLoadedScheduler {
        &self.scheduler
    }

    fn mailbox(&self, node_id: &str) -> Arc<Mailbox> {
        self.mailboxes
            .entry(node_id.to_string())
            .or_default()
            .clone()
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    pub fn register_node(
        &self,
        node_id: &str,
        capacity: NodeCapacity,
        metadata: HashMap<String, String>,
    ) -> Node {
        self.registry.register(node_id, capacity, metadata)
    }

    /// Record a heartbeat. A node reporting `failed` gives up its runs.
    pub fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Option<Node> {
        let was_failed = self.registry.get(node_id)?.is_failed();
        let node = self.registry.heartbeat(node_id, status)?;

        if status.state == NodeState::Failed && !was_failed {
            tracing::warn!(node_id, "Node reported failure");
            self.requeue_node_runs(node_id);
        } else if status.state == NodeState::Active && was_failed {
            tracing::info!(node_id, "Node recovered");
        }
        Some(node)
    }

    pub fn get_node(&self, node_id: &str) -> Option<Node> {
        self.registry.get(node_id)
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.registry.list()
    }

    pub fn node_load(&self) -> BTreeMap<String, NodeLoad> {
        self.scheduler.get_node_load()
    }

    // ---------------------------------------------------------------------
    // Agents and runs
    // ---------------------------------------------------------------------

    pub fn register_agent(&self, spec: AgentSpec) {
        tracing::info!(agent_id = %spec.agent_id, version = %spec.version, "Agent registered");
        self.agents
            .insert((spec.agent_id.clone(), spec.version.clone()), spec);
    }

    pub fn get_agent(&self, agent_id: &str, version: &str) -> Option<AgentSpec> {
        self.agents
            .get(&(agent_id.to_string(), version.to_string()))
            .map(|spec| spec.clone())
    }

    pub fn create_run(
        &self,
        agent_id: &str,
        version: &str,
        input: String,
        constraints: HashMap<String, String>,
    ) -> Result<Run> {
        if self.get_agent(agent_id, version).is_none() {
            return Err(FleetError::AgentNotFound {
                agent_id: agent_id.to_string(),
                version: version.to_string(),
            });
        }
        let run = Run::new(agent_id, version, input).with_constraints(constraints);
        if !self.runs.insert(run.clone()) {
            return Err(FleetError::RunStoreFull);
        }
        tracing::info!(run_id = %run.run_id, agent_id, version, "Run created");
        Ok(run)
    }

    pub fn get_run(&self, run_id: &Uuid) -> Result<Run> {
        self.runs.get(run_id).ok_or(FleetError::RunNotFound(*run_id))
    }

    pub fn list_runs(&self) -> Vec<Run> {
        self.runs.all_runs()
    }

    /// `node_id` reports success. Only the node holding the lease may end it.
    pub fn complete_run(
        &self,
        run_id: &Uuid,
        node_id: &str,
        output: Option<String>,
        costs: RunCosts,
    ) -> Result<Run> {
        let run = self.runs.update(run_id, |run| {
            check_lease_holder(run, node_id, RunStatus::Completed)?;
            run.complete(output, costs)
        })?;
        tracing::info!(
            run_id = %run_id,
            node_id,
            tokens = costs.tokens,
            usd = costs.usd,
            "Run completed"
        );
        Ok(run)
    }

    pub fn fail_run(
        &self,
        run_id: &Uuid,
        node_id: &str,
        error: RunErrorInfo,
        costs: RunCosts,
    ) -> Result<Run> {
        let message = error.message.clone();
        let run = self.runs.update(run_id, |run| {
            check_lease_holder(run, node_id, RunStatus::Failed)?;
            run.fail(error, costs)
        })?;
        tracing::warn!(run_id = %run_id, node_id, error = %message, "Run failed");
        Ok(run)
    }

    pub fn cancel_run(&self, run_id: &Uuid) -> Result<Run> {
        let run = self.runs.update(run_id, |run| run.cancel())?;
        tracing::info!(run_id = %run_id, "Run cancelled");
        Ok(run)
    }

    // ---------------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------------

    /// Place every pending run, oldest first. Returns the number placed.
    pub fn dispatch_pending(&self) -> usize {
        let mut placed_count = 0;

        for pending in self.runs.pending_runs() {
            let mut placed = None;
            let result = self.runs.update(&pending.run_id, |run| {
                if run.status == RunStatus::Pending {
                    placed = self.scheduler.schedule_run(run, None);
                }
                Ok(())
            });
            if result.is_err() {
                continue;
            }

            if let Some(node_id) = placed {
                self.registry.debit_slot(&node_id);
                self.mailbox(&node_id).push(pending.run_id);
                placed_count += 1;
            }
        }

        if placed_count > 0 {
            tracing::debug!(placed = placed_count, "Dispatched pending runs");
        }
        placed_count
    }

    /// Wait up to `wait` for an assignment addressed to `node_id`.
    pub async fn pull_lease(&self, node_id: &str, wait: Duration) -> Option<Assignment> {
        let mailbox = self.mailbox(node_id);
        let wait = wait.min(Duration::from_millis(self.config.max_pull_wait_ms));
        let deadline = Instant::now() + wait;

        loop {
            let notified = mailbox.notify.notified();
            while let Some(run_id) = mailbox.pop() {
                if let Some(assignment) = self.assignment_for(run_id, node_id) {
                    tracing::debug!(run_id = %run_id, node_id, "Lease handed out");
                    return Some(assignment);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Build an assignment if the run is still scheduled on `node_id`.
    /// Entries left behind by cancellation or requeueing are skipped.
    fn assignment_for(&self, run_id: Uuid, node_id: &str) -> Option<Assignment> {
        let run = self.runs.get(&run_id)?;
        if run.status != RunStatus::Scheduled || run.node_id.as_deref() != Some(node_id) {
            return None;
        }
        let Some(agent_spec) = self.get_agent(&run.agent_id, &run.version) else {
            tracing::error!(run_id = %run_id, agent_id = %run.agent_id, "Agent definition missing");
            return None;
        };
        Some(Assignment {
            run_id,
            agent_spec,
            input: run.input,
        })
    }

    /// The worker confirmed receipt: `scheduled -> running`.
    pub fn ack_lease(&self, run_id: &Uuid, node_id: &str) -> Result<Run> {
        let run = self.runs.update(run_id, |run| {
            check_lease_holder(run, node_id, RunStatus::Running)?;
            run.start()
        })?;
        tracing::info!(run_id = %run_id, node_id, "Lease acknowledged");
        Ok(run)
    }

    /// Send every unfinished run of `node_id` back to `pending`.
    pub fn requeue_node_runs(&self, node_id: &str) -> usize {
        let mut requeued = 0;
        for run in self.runs.active_runs_for_node(node_id) {
            if self.runs.update(&run.run_id, |r| r.requeue()).is_ok() {
                tracing::info!(run_id = %run.run_id, node_id, "Run requeued");
                requeued += 1;
            }
        }
        requeued
    }

    /// Fail nodes whose heartbeat is stale, release leases that were never
    /// acknowledged within the same window and drop finished runs past their
    /// retention.
    pub fn sweep(&self) {
        let window = self.config.staleness_window();
        for node_id in self.registry.sweep_stale(window) {
            self.requeue_node_runs(&node_id);
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        for run in self.runs.all_runs() {
            let unacked = run.status == RunStatus::Scheduled
                && run.timings.scheduled_at.is_some_and(|at| at < cutoff);
            if unacked && self.runs.update(&run.run_id, |r| r.requeue()).is_ok() {
                tracing::warn!(run_id = %run.run_id, node_id = ?run.node_id, "Lease not acknowledged, requeued");
            }
        }

        let retention = chrono::Duration::from_std(self.config.finished_run_retention())
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let retained_since = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let evicted = self.runs.evict_finished_before(retained_since);
        if evicted > 0 {
            tracing::debug!(evicted, "Dropped finished runs past retention");
        }
    }

    /// Sweep and dispatch on the configured cadence until `shutdown` fires.
    pub async fn run_dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.dispatch_interval_ms));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                    self.dispatch_pending();
                }
            }
        }
        tracing::info!("Dispatch loop stopped");
    }
}

/// Reject a transition to `to` requested by a node that does not hold the
/// run. Terminal runs fall through so the transition reports `RunTerminal`.
fn check_lease_holder(run: &Run, node_id: &str, to: RunStatus) -> Result<()> {
    if run.status.is_terminal() || run.node_id.as_deref() == Some(node_id) {
        return Ok(());
    }
    tracing::warn!(run_id = %run.run_id, node_id, holder = ?run.node_id, "Report from a node without the lease");
    Err(FleetError::InvalidTransition {
        run_id: run.run_id,
        from: run.status,
        to,
    })
}
