use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::LeaseClient;
use crate::scheduler::{NodeCapacity, NodeStatus};
use crate::worker::NodeCapacityTracker;

/// Periodically reports this worker's live capacity to the control plane.
pub struct HeartbeatSender {
    client: Arc<dyn LeaseClient>,
    node_id: String,
    metadata: HashMap<String, String>,
    tracker: Arc<NodeCapacityTracker>,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(
        client: Arc<dyn LeaseClient>,
        node_id: impl Into<String>,
        metadata: HashMap<String, String>,
        tracker: Arc<NodeCapacityTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            node_id: node_id.into(),
            metadata,
            tracker,
            interval,
        }
    }

    /// Current status as derived from the capacity tracker. A draining
    /// worker reports no free slots.
    pub fn status(&self) -> NodeStatus {
        NodeStatus::active(
            self.tracker.get_active_leases() as u32,
            self.tracker.advertised_slots() as u32,
        )
    }

    /// Send one heartbeat. Re-registers when the control plane has forgotten
    /// this node.
    pub async fn beat(&self) -> crate::error::Result<()> {
        let status = self.status();
        if self.client.heartbeat(&self.node_id, status).await?.is_some() {
            return Ok(());
        }

        tracing::warn!(node_id = %self.node_id, "Control plane does not know this node, re-registering");
        let capacity = NodeCapacity {
            total_slots: self.tracker.max_concurrent() as u32,
        };
        self.client
            .register(&self.node_id, capacity, &self.metadata)
            .await?;
        self.client.heartbeat(&self.node_id, status).await?;
        Ok(())
    }

    /// Run until `stop` fires. When `drain` fires the worker starts draining
    /// and a heartbeat goes out at once so no more work is placed here.
    /// Failed heartbeats are logged and retried on the next tick.
    pub async fn run(&self, stop: CancellationToken, drain: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        let mut drain_announced = false;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = drain.cancelled(), if !drain_announced => {
                    drain_announced = true;
                    self.tracker.begin_drain();
                    tracing::info!(node_id = %self.node_id, "Draining, advertising no free slots");
                    self.beat_logged().await;
                }
                _ = interval.tick() => self.beat_logged().await,
            }
        }
        tracing::debug!(node_id = %self.node_id, "Heartbeat stopped");
    }

    async fn beat_logged(&self) {
        if let Err(e) = self.beat().await {
            tracing::warn!(node_id = %self.node_id, error = %e, "Heartbeat failed");
        }
    }
}
