//! Agent definitions and the executor seam.
//!
//! The actual model call happens behind [`AgentExecutor`]; this crate only
//! knows how to hand it an [`AgentSpec`] plus input text and how to interpret
//! the [`AgentExecutionResult`] that comes back.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Resource ceiling for a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConstraints {
    pub max_tokens: u32,
    pub max_duration_seconds: u64,
}

impl BudgetConstraints {
    pub fn new(max_tokens: u32, max_duration_seconds: u64) -> Self {
        Self {
            max_tokens,
            max_duration_seconds,
        }
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_seconds)
    }
}

impl Default for BudgetConstraints {
    fn default() -> Self {
        Self::new(4_000, 60)
    }
}

/// Immutable definition of an agent version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub agent_id: String,
    pub version: String,
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub model_profile: HashMap<String, serde_json::Value>,
    pub budget: BudgetConstraints,
}

impl AgentSpec {
    pub fn new(
        agent_id: impl Into<String>,
        version: impl Into<String>,
        budget: BudgetConstraints,
    ) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            version: version.into(),
            instructions: String::new(),
            model_profile: HashMap::new(),
            budget,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_model_setting(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.model_profile.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one execution attempt. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration: Duration,
    pub usd_cost: f64,
    pub metadata: HashMap<String, String>,
}

impl AgentExecutionResult {
    pub fn success(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            tokens_in: 0,
            tokens_out: 0,
            duration,
            usd_cost: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            tokens_in: 0,
            tokens_out: 0,
            duration,
            usd_cost: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_usage(mut self, tokens_in: u64, tokens_out: u64, usd_cost: f64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self.usd_cost = usd_cost;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// Runs one agent invocation.
///
/// Implementations convert every failure they can observe into a failed
/// [`AgentExecutionResult`]. `Err` is reserved for cancellation
/// ([`FleetError::Cancelled`](crate::error::FleetError::Cancelled)) and faults
/// the implementation could not classify.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &AgentSpec,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult>;
}
