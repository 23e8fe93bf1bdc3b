use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentExecutor;
use crate::client::{ControlClient, LeaseClient};
use crate::config::{ControlConfig, WorkerConfig};
use crate::control::{api, ControlPlane};
use crate::error::Result;
use crate::scheduler::NodeCapacity;
use crate::worker::{HeartbeatSender, LeaseLoop, NodeCapacityTracker, SandboxExecutor};

/// Control plane process: HTTP API plus the dispatch loop.
pub struct ControlNode {
    pub config: ControlConfig,
    pub plane: Arc<ControlPlane>,
}

impl ControlNode {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            plane: Arc::new(ControlPlane::new(config.clone())),
            config,
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// The dispatch loop runs as a spawned task; the API server runs on the
    /// calling task and returns once in-flight requests have finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = %self.config.listen_addr,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            staleness_ms = self.config.staleness_window().as_millis() as u64,
            "Starting control plane"
        );

        let dispatch = tokio::spawn(self.plane.clone().run_dispatch_loop(shutdown.clone()));
        let served = api::run_api(self.config.listen_addr, self.plane.clone(), shutdown.clone()).await;

        // Make sure the dispatch loop stops even if the server failed early.
        shutdown.cancel();
        if let Err(e) = dispatch.await {
            tracing::error!(error = %e, "Dispatch loop task failed");
        }
        served
    }
}

/// Worker process: registration, heartbeat and the lease loop.
pub struct WorkerNode {
    pub config: WorkerConfig,
    client: Arc<dyn LeaseClient>,
    executor: Arc<dyn AgentExecutor>,
    tracker: Arc<NodeCapacityTracker>,
}

impl WorkerNode {
    /// Worker that talks HTTP to `config.control_url` and executes runs in
    /// sandboxed child processes.
    pub fn new(config: WorkerConfig) -> Self {
        let client = Arc::new(ControlClient::new(config.control_url.clone()));
        let executor = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
        Self::with_parts(config, client, executor)
    }

    pub fn with_parts(
        config: WorkerConfig,
        client: Arc<dyn LeaseClient>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            tracker: Arc::new(NodeCapacityTracker::new(config.max_concurrent)),
            config,
            client,
            executor,
        }
    }

    pub fn tracker(&self) -> Arc<NodeCapacityTracker> {
        self.tracker.clone()
    }

    /// Register, keep retrying with backoff until the control plane answers.
    /// Returns false if `shutdown` fired first.
    async fn register(&self, shutdown: &CancellationToken) -> bool {
        let policy = self.config.reconnect_policy();
        let capacity = NodeCapacity {
            total_slots: self.config.max_concurrent as u32,
        };
        let mut attempt: u32 = 0;

        loop {
            let registered = tokio::select! {
                _ = shutdown.cancelled() => return false,
                registered = self.client.register(&self.config.node_id, capacity, &self.config.metadata) => registered,
            };
            match registered {
                Ok(node) => {
                    tracing::info!(
                        node_id = %node.node_id,
                        total_slots = node.capacity.total_slots,
                        "Registered with control plane"
                    );
                    return true;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        node_id = %self.config.node_id,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Registration failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run until `shutdown` fires and in-flight runs have drained.
    ///
    /// Heartbeats keep flowing while the lease loop drains so the control
    /// plane does not declare this node stale mid-drain. They advertise no
    /// free slots from the moment shutdown is requested.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            node_id = %self.config.node_id,
            control_url = %self.config.control_url,
            max_concurrent = self.config.max_concurrent,
            "Starting worker"
        );

        if !self.register(&shutdown).await {
            tracing::info!(node_id = %self.config.node_id, "Shutdown before registration");
            return Ok(());
        }

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = HeartbeatSender::new(
            self.client.clone(),
            self.config.node_id.clone(),
            self.config.metadata.clone(),
            self.tracker.clone(),
            self.config.heartbeat_interval(),
        );
        let heartbeat_task = tokio::spawn({
            let stop = heartbeat_stop.clone();
            let drain = shutdown.clone();
            async move { heartbeat.run(stop, drain).await }
        });

        let lease_loop = LeaseLoop::new(
            &self.config,
            self.client.clone(),
            self.executor.clone(),
            self.tracker.clone(),
        );
        lease_loop.run(shutdown).await;

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat_task.await {
            tracing::error!(error = %e, "Heartbeat task failed");
        }
        tracing::info!(node_id = %self.config.node_id, "Worker stopped");
        Ok(())
    }
}
