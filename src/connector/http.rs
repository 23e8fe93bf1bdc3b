use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;

use crate::config::DeliveryConfig;
use crate::connector::retry::{is_retryable_status, RetryPolicy};
use crate::connector::{OutgoingMessage, OutputConnector, SendMessageResult};
use crate::error::Result;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Publishes messages to an HTTP endpoint with retry, backoff and jitter.
///
/// Every attempt for a message carries the same `Idempotency-Key` (the
/// message id) so the receiver can drop duplicates. Network errors, timeouts,
/// 5xx, 408 and 429 are retried up to the configured attempt budget; any other
/// non-success status fails immediately as non-retryable.
#[derive(Debug)]
pub struct HttpOutputConnector {
    client: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
}

impl HttpOutputConnector {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &DeliveryConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            policy: RetryPolicy::from_config(config),
        }
    }

    async fn attempt(&self, message: &OutgoingMessage) -> SendMessageResult {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, message.content_type.as_str())
            .header(IDEMPOTENCY_KEY_HEADER, message.message_id.as_str());
        if let Some(correlation_id) = &message.correlation_id {
            request = request.header(CORRELATION_ID_HEADER, correlation_id.as_str());
        }
        for (name, value) in &message.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.body(message.body.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                // Builder errors (bad header, bad URL) will not fix themselves.
                let retryable = !e.is_builder();
                return SendMessageResult::failed(
                    format!("Request failed: {}", e),
                    None,
                    retryable,
                );
            }
        };

        let status = response.status();
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        if status.is_success() {
            return SendMessageResult::delivered(status.as_u16(), body);
        }

        let mut result = SendMessageResult::failed(
            format!("Endpoint returned {}", status),
            Some(status.as_u16()),
            is_retryable_status(status.as_u16()),
        );
        result.response_body = body;
        result
    }
}

#[async_trait]
impl OutputConnector for HttpOutputConnector {
    async fn send(
        &self,
        message: &OutgoingMessage,
        cancel: &CancellationToken,
    ) -> SendMessageResult {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return SendMessageResult::failed("Delivery cancelled", None, true);
                }
                result = self.attempt(message) => result,
            };

            if result.success {
                tracing::debug!(
                    message_id = %message.message_id,
                    attempt,
                    status = ?result.status_code,
                    "Message delivered"
                );
                return result;
            }
            if !result.is_retryable || attempt >= max_attempts {
                tracing::warn!(
                    message_id = %message.message_id,
                    attempt,
                    status = ?result.status_code,
                    retryable = result.is_retryable,
                    error = ?result.error_message,
                    "Delivery failed"
                );
                return result;
            }

            let delay = self.policy.delay_for(attempt);
            tracing::info!(
                message_id = %message.message_id,
                attempt,
                status = ?result.status_code,
                delay_ms = delay.as_millis() as u64,
                "Delivery attempt failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return SendMessageResult::failed("Delivery cancelled", None, true);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
