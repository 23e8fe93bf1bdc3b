//! Receive → classify → execute → dispose loop for connector-sourced work.
//!
//! Every received message ends in exactly one disposition:
//!
//! | Situation | Disposition |
//! |---|---|
//! | `delivery_count > max_delivery_count` | dead-letter `PoisonMessage`, executor not called |
//! | execution succeeded (and result published, if a sink is set) | complete |
//! | failure matching a non-retryable signature | dead-letter `NonRetryableError` |
//! | retryable failure, `delivery_count >= max_delivery_count` | dead-letter `MaxDeliveryCountExceeded` |
//! | retryable failure below the limit | abandon |
//! | executor fault, panic or cancellation | abandon |
//!
//! A failure seen after `cancel` fired is treated as cancellation, so
//! shutting down never dead-letters a message.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentExecutor;
use crate::config::PipelineConfig;
use crate::connector::{
    CompletionResult, DeadLetterReason, InputConnector, OutgoingMessage, OutputConnector,
    ReceivedMessage,
};

/// Error text fragments that mark a failure as permanent.
const NON_RETRYABLE_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "duration exceeded",
    "deserializ",
    "invalid format",
    "format error",
    "unauthorized",
    "forbidden",
    "not found",
];

/// Pause after a failed receive before polling the source again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Final state chosen for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Abandoned,
    DeadLettered(DeadLetterReason),
}

/// True when `error` matches one of the permanent failure signatures.
pub fn is_non_retryable_error(error: &str) -> bool {
    let error = error.to_lowercase();
    NON_RETRYABLE_SIGNATURES
        .iter()
        .any(|signature| error.contains(signature))
}

/// Disposition for a failed execution.
///
/// Non-retryable failures are dead-lettered whatever the delivery count;
/// retryable ones are abandoned until the delivery budget is spent.
pub fn failure_disposition(
    non_retryable: bool,
    delivery_count: u32,
    max_delivery_count: u32,
) -> Disposition {
    if non_retryable {
        Disposition::DeadLettered(DeadLetterReason::NonRetryableError)
    } else if delivery_count >= max_delivery_count {
        Disposition::DeadLettered(DeadLetterReason::MaxDeliveryCountExceeded)
    } else {
        Disposition::Abandoned
    }
}

/// Drives messages from an [`InputConnector`] through an [`AgentExecutor`].
pub struct MessageProcessor {
    config: PipelineConfig,
    input: Arc<dyn InputConnector>,
    executor: Arc<dyn AgentExecutor>,
    output: Option<Arc<dyn OutputConnector>>,
}

impl MessageProcessor {
    pub fn new(
        config: PipelineConfig,
        input: Arc<dyn InputConnector>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            config,
            input,
            executor,
            output: None,
        }
    }

    /// Publish each successful output before completing its message.
    pub fn with_output(mut self, output: Arc<dyn OutputConnector>) -> Self {
        self.output = Some(output);
        self
    }

    /// Poll until `shutdown` fires. Messages in a batch are processed
    /// concurrently; the loop only exits between batches, after every
    /// message of the current batch has been disposed.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            agent_id = %self.config.agent.agent_id,
            max_messages = self.config.max_messages,
            max_delivery_count = self.config.max_delivery_count,
            "Message processor started"
        );

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.input.receive(self.config.max_messages, self.config.max_wait()) => received,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "Receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                    }
                }
            };
            if batch.is_empty() {
                continue;
            }

            tracing::debug!(count = batch.len(), "Received batch");
            join_all(
                batch
                    .into_iter()
                    .map(|message| self.process_message(message, &shutdown)),
            )
            .await;
        }

        tracing::info!("Message processor stopped");
    }

    /// Take one message to its terminal disposition.
    pub async fn process_message(
        &self,
        message: ReceivedMessage,
        cancel: &CancellationToken,
    ) -> Disposition {
        let max = self.config.max_delivery_count;

        if message.delivery_count > max {
            let description = format!(
                "Message delivered {} times, exceeding the maximum of {}",
                message.delivery_count, max
            );
            return self
                .dispose(
                    message,
                    Disposition::DeadLettered(DeadLetterReason::PoisonMessage),
                    description,
                )
                .await;
        }

        let spec = &self.config.agent;
        let executed = AssertUnwindSafe(self.executor.execute(spec, &message.body, cancel))
            .catch_unwind()
            .await;

        let result = match executed {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let description = format!("Execution did not complete: {}", e);
                return self
                    .dispose(message, Disposition::Abandoned, description)
                    .await;
            }
            Err(_) => {
                tracing::error!(message_id = %message.message_id, "Executor panicked");
                return self
                    .dispose(
                        message,
                        Disposition::Abandoned,
                        "Executor panicked".to_string(),
                    )
                    .await;
            }
        };

        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| "Execution failed without an error message".to_string());
            if cancel.is_cancelled() {
                return self
                    .dispose(message, Disposition::Abandoned, format!("Cancelled: {}", error))
                    .await;
            }
            let disposition = failure_disposition(
                is_non_retryable_error(&error),
                message.delivery_count,
                max,
            );
            return self.dispose(message, disposition, error).await;
        }

        if let Some(output) = &self.output {
            let outgoing = OutgoingMessage::new(
                message.message_id.clone(),
                result.output.unwrap_or_default(),
            )
            .with_correlation_id(message.correlation_id.clone());
            let sent = output.send(&outgoing, cancel).await;
            if !sent.success {
                let error = format!(
                    "Publishing result failed: {}",
                    sent.error_message.as_deref().unwrap_or("unknown error")
                );
                if cancel.is_cancelled() {
                    return self
                        .dispose(message, Disposition::Abandoned, error)
                        .await;
                }
                let disposition =
                    failure_disposition(!sent.is_retryable, message.delivery_count, max);
                return self.dispose(message, disposition, error).await;
            }
        }

        self.dispose(message, Disposition::Completed, String::new())
            .await
    }

    async fn dispose(
        &self,
        message: ReceivedMessage,
        disposition: Disposition,
        description: String,
    ) -> Disposition {
        let message_id = message.message_id.clone();
        let delivery_count = message.delivery_count;

        let outcome: CompletionResult = match disposition {
            Disposition::Completed => self.input.complete(message).await,
            Disposition::Abandoned => self.input.abandon(message).await,
            Disposition::DeadLettered(reason) => {
                self.input.dead_letter(message, reason, description.clone()).await
            }
        };

        match disposition {
            Disposition::Completed => {
                tracing::info!(message_id = %message_id, delivery_count, "Message completed");
            }
            Disposition::Abandoned => {
                tracing::warn!(
                    message_id = %message_id,
                    delivery_count,
                    reason = %description,
                    "Message abandoned"
                );
            }
            Disposition::DeadLettered(reason) => {
                tracing::warn!(
                    message_id = %message_id,
                    delivery_count,
                    reason = %reason,
                    description = %description,
                    "Message dead-lettered"
                );
            }
        }
        if !outcome.success {
            tracing::error!(
                message_id = %message_id,
                disposition = ?disposition,
                error = ?outcome.error_message,
                "Source refused disposition"
            );
        }

        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_case_insensitive() {
        assert!(is_non_retryable_error("Execution Timed Out after 5s"));
        assert!(is_non_retryable_error("Failed to deserialize response"));
        assert!(is_non_retryable_error("401 Unauthorized"));
        assert!(is_non_retryable_error("403 FORBIDDEN"));
        assert!(is_non_retryable_error("agent not found"));
        assert!(is_non_retryable_error("input format error"));
        assert!(is_non_retryable_error("Invalid format in request body"));
        assert!(!is_non_retryable_error("upstream returned no information, retry later"));
        assert!(!is_non_retryable_error("failed to transform output"));
        assert!(!is_non_retryable_error("connection reset by peer"));
        assert!(!is_non_retryable_error("503 Service Unavailable"));
    }

    #[test]
    fn failure_disposition_table() {
        use DeadLetterReason::*;
        assert_eq!(
            failure_disposition(true, 1, 3),
            Disposition::DeadLettered(NonRetryableError)
        );
        assert_eq!(failure_disposition(false, 2, 3), Disposition::Abandoned);
        assert_eq!(
            failure_disposition(false, 3, 3),
            Disposition::DeadLettered(MaxDeliveryCountExceeded)
        );
        assert_eq!(
            failure_disposition(true, 3, 3),
            Disposition::DeadLettered(NonRetryableError)
        );
    }
}
