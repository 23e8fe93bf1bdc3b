//! HTTP client for the control plane API.
//!
//! Workers use the [`LeaseClient`] half (register, heartbeat, pull, ack,
//! report); the CLI uses the operator calls on [`ControlClient`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::agent::AgentSpec;
use crate::connector::retry::is_retryable_status;
use crate::error::{FleetError, Result};
use crate::protocol::{
    AckRequest, Assignment, CreateRunRequest, ErrorBody, PullRequest, RegisterNodeRequest,
    RunOutcome,
};
use crate::scheduler::{Node, NodeCapacity, NodeLoad, NodeStatus, Run};

/// Extra time allowed on top of the long-poll wait before the request is
/// considered lost.
const PULL_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// The worker's view of the control plane.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn register(
        &self,
        node_id: &str,
        capacity: NodeCapacity,
        metadata: &HashMap<String, String>,
    ) -> Result<Node>;

    /// `Ok(None)` when the control plane no longer knows the node.
    async fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Result<Option<Node>>;

    /// Long-poll for the next assignment; `Ok(None)` when the wait expires.
    async fn pull(&self, node_id: &str, wait: Duration) -> Result<Option<Assignment>>;

    async fn ack(&self, run_id: Uuid, node_id: &str) -> Result<()>;

    async fn report(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send().await?;
        decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        decode(response).await
    }

    pub async fn register_agent(&self, spec: &AgentSpec) -> Result<AgentSpec> {
        self.post_json("/v1/agents", spec).await
    }

    pub async fn create_run(&self, request: &CreateRunRequest) -> Result<Run> {
        self.post_json("/v1/runs", request).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.get_json(&format!("/v1/runs/{}", run_id)).await
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        self.get_json("/v1/runs").await
    }

    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        self.post_json(&format!("/v1/runs/{}/cancel", run_id), &())
            .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.get_json("/v1/nodes").await
    }

    pub async fn node_load(&self) -> Result<BTreeMap<String, NodeLoad>> {
        self.get_json("/v1/nodes/load").await
    }
}

/// Map a non-success response to an error carrying the server's error text:
/// [`FleetError::LeaseChannel`] when the status is worth retrying,
/// [`FleetError::Rejected`] otherwise.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(status_error(status, message))
}

fn status_error(status: StatusCode, message: String) -> FleetError {
    let text = format!("{}: {}", status, message);
    if is_retryable_status(status.as_u16()) {
        FleetError::LeaseChannel(text)
    } else {
        FleetError::Rejected(text)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    Ok(check(response).await?.json::<T>().await?)
}

#[async_trait]
impl LeaseClient for ControlClient {
    async fn register(
        &self,
        node_id: &str,
        capacity: NodeCapacity,
        metadata: &HashMap<String, String>,
    ) -> Result<Node> {
        let request = RegisterNodeRequest {
            node_id: node_id.to_string(),
            capacity,
            metadata: metadata.clone(),
        };
        self.post_json("/v1/nodes", &request).await
    }

    async fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Result<Option<Node>> {
        let response = self
            .http
            .post(self.url(&format!("/v1/nodes/{}/heartbeat", node_id)))
            .json(&status)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn pull(&self, node_id: &str, wait: Duration) -> Result<Option<Assignment>> {
        let request = PullRequest {
            node_id: node_id.to_string(),
            wait_ms: wait.as_millis() as u64,
        };
        let response = self
            .http
            .post(self.url("/v1/lease/pull"))
            .timeout(wait + PULL_TIMEOUT_MARGIN)
            .json(&request)
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn ack(&self, run_id: Uuid, node_id: &str) -> Result<()> {
        let request = AckRequest {
            node_id: node_id.to_string(),
        };
        let response = self
            .http
            .post(self.url(&format!("/v1/lease/{}/ack", run_id)))
            .json(&request)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    async fn report(&self, run_id: Uuid, outcome: &RunOutcome) -> Result<()> {
        let request = match outcome {
            RunOutcome::Completed(body) => self
                .http
                .post(self.url(&format!("/v1/lease/{}/complete", run_id)))
                .json(body),
            RunOutcome::Failed(body) => self
                .http
                .post(self.url(&format!("/v1/lease/{}/fail", run_id)))
                .json(body),
        };
        let response = request.send().await?;
        check(response).await.map(|_| ())
    }
}
