//! Message source and sink contracts.
//!
//! An [`InputConnector`] hands out [`ReceivedMessage`]s and accepts exactly one
//! terminal disposition per delivery. The disposition methods take the message
//! by value, so a message cannot be disposed twice or kept after disposal.
//! An [`OutputConnector`] publishes [`OutgoingMessage`]s and reports whether a
//! failure is worth retrying; it never decides the fate of the input message.

pub mod http;
pub mod memory;
pub mod retry;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

pub use http::HttpOutputConnector;
pub use memory::InMemoryQueue;
pub use retry::RetryPolicy;

/// Opaque handle the source uses to match a disposition to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckContext(pub Uuid);

/// One delivery of a unit of external work.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub correlation_id: Option<String>,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_count: u32,
    pub enqueued_time: DateTime<Utc>,
    pub ack_context: AckContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    PoisonMessage,
    NonRetryableError,
    MaxDeliveryCountExceeded,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::PoisonMessage => write!(f, "PoisonMessage"),
            DeadLetterReason::NonRetryableError => write!(f, "NonRetryableError"),
            DeadLetterReason::MaxDeliveryCountExceeded => write!(f, "MaxDeliveryCountExceeded"),
        }
    }
}

/// Whether the source accepted a disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub success: bool,
    pub error_message: Option<String>,
}

impl CompletionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait InputConnector: Send + Sync {
    /// Pull up to `max_messages`, waiting at most `max_wait` for the first one.
    async fn receive(&self, max_messages: usize, max_wait: Duration)
        -> Result<Vec<ReceivedMessage>>;

    async fn complete(&self, message: ReceivedMessage) -> CompletionResult;

    /// Release the message for redelivery.
    async fn abandon(&self, message: ReceivedMessage) -> CompletionResult;

    async fn dead_letter(
        &self,
        message: ReceivedMessage,
        reason: DeadLetterReason,
        description: String,
    ) -> CompletionResult;
}

/// Outbound payload. `message_id` doubles as the idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub body: String,
    pub correlation_id: Option<String>,
    pub content_type: String,
    pub headers: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            correlation_id: None,
            content_type: "application/json".to_string(),
            headers: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub is_retryable: bool,
}

impl SendMessageResult {
    pub fn delivered(status_code: u16, response_body: Option<String>) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            response_body,
            error_message: None,
            is_retryable: false,
        }
    }

    pub fn failed(error: impl Into<String>, status_code: Option<u16>, is_retryable: bool) -> Self {
        Self {
            success: false,
            status_code,
            response_body: None,
            error_message: Some(error.into()),
            is_retryable,
        }
    }
}

#[async_trait]
pub trait OutputConnector: Send + Sync {
    /// Deliver `message`, retrying transient failures. Cancellation ends the
    /// attempt loop with a retryable failure.
    async fn send(&self, message: &OutgoingMessage, cancel: &CancellationToken)
        -> SendMessageResult;
}
