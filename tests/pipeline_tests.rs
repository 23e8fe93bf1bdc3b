use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agent_fleet::agent::{AgentExecutionResult, AgentExecutor, AgentSpec, BudgetConstraints};
use agent_fleet::config::PipelineConfig;
use agent_fleet::connector::{
    AckContext, CompletionResult, DeadLetterReason, InMemoryQueue, InputConnector,
    OutgoingMessage, OutputConnector, ReceivedMessage, SendMessageResult,
};
use agent_fleet::error::{FleetError, Result};
use agent_fleet::pipeline::{Disposition, MessageProcessor};

// =============================================================================
// Test doubles
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Complete(String),
    Abandon(String),
    DeadLetter(String, DeadLetterReason),
}

/// Input connector that records every disposition call.
#[derive(Default)]
struct RecordingConnector {
    calls: Mutex<Vec<Call>>,
}

impl RecordingConnector {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InputConnector for RecordingConnector {
    async fn receive(&self, _: usize, max_wait: Duration) -> Result<Vec<ReceivedMessage>> {
        tokio::time::sleep(max_wait).await;
        Ok(Vec::new())
    }

    async fn complete(&self, message: ReceivedMessage) -> CompletionResult {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Complete(message.message_id));
        CompletionResult::ok()
    }

    async fn abandon(&self, message: ReceivedMessage) -> CompletionResult {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Abandon(message.message_id));
        CompletionResult::ok()
    }

    async fn dead_letter(
        &self,
        message: ReceivedMessage,
        reason: DeadLetterReason,
        description: String,
    ) -> CompletionResult {
        assert!(!description.is_empty(), "dead-letter needs a description");
        self.calls
            .lock()
            .unwrap()
            .push(Call::DeadLetter(message.message_id, reason));
        CompletionResult::ok()
    }
}

enum Behaviour {
    Succeed,
    FailWith(&'static str),
    Error,
    Panic,
}

/// Executor that counts invocations and behaves as scripted.
struct ScriptedExecutor {
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _spec: &AgentSpec,
        input: &str,
        _cancel: &CancellationToken,
    ) -> Result<AgentExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Succeed => Ok(AgentExecutionResult::success(
                format!("echo: {}", input),
                Duration::from_millis(1),
            )),
            Behaviour::FailWith(error) => {
                Ok(AgentExecutionResult::failure(error, Duration::from_millis(1)))
            }
            Behaviour::Error => Err(FleetError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sandbox pipe closed",
            ))),
            Behaviour::Panic => panic!("executor blew up"),
        }
    }
}

/// Output connector returning a fixed result and recording what it was sent.
struct FixedOutput {
    result: SendMessageResult,
    sent: Mutex<Vec<OutgoingMessage>>,
}

impl FixedOutput {
    fn new(result: SendMessageResult) -> Arc<Self> {
        Arc::new(Self {
            result,
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl OutputConnector for FixedOutput {
    async fn send(&self, message: &OutgoingMessage, _: &CancellationToken) -> SendMessageResult {
        self.sent.lock().unwrap().push(message.clone());
        self.result.clone()
    }
}

fn message(delivery_count: u32) -> ReceivedMessage {
    ReceivedMessage {
        message_id: format!("msg-{}", delivery_count),
        body: "hello".to_string(),
        correlation_id: Some("corr-7".to_string()),
        delivery_count,
        enqueued_time: Utc::now(),
        ack_context: AckContext(Uuid::new_v4()),
    }
}

fn config(max_delivery_count: u32) -> PipelineConfig {
    PipelineConfig::new(AgentSpec::new("echo", "1", BudgetConstraints::new(100, 5)))
        .with_max_delivery_count(max_delivery_count)
        .with_max_wait_ms(20)
}

fn processor(
    max_delivery_count: u32,
    connector: &Arc<RecordingConnector>,
    executor: &Arc<ScriptedExecutor>,
) -> MessageProcessor {
    MessageProcessor::new(config(max_delivery_count), connector.clone(), executor.clone())
}

// =============================================================================
// Disposition rules
// =============================================================================

#[tokio::test]
async fn test_poison_message_skips_executor() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let processor = processor(3, &connector, &executor);

    let disposition = processor
        .process_message(message(4), &CancellationToken::new())
        .await;

    assert_eq!(
        disposition,
        Disposition::DeadLettered(DeadLetterReason::PoisonMessage)
    );
    assert_eq!(executor.calls(), 0);
    assert_eq!(
        connector.calls(),
        vec![Call::DeadLetter(
            "msg-4".to_string(),
            DeadLetterReason::PoisonMessage
        )]
    );
}

#[tokio::test]
async fn test_failure_at_max_delivery_is_dead_lettered() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::FailWith("upstream connection reset"));
    let processor = processor(3, &connector, &executor);

    processor
        .process_message(message(3), &CancellationToken::new())
        .await;

    assert_eq!(executor.calls(), 1);
    assert_eq!(
        connector.calls(),
        vec![Call::DeadLetter(
            "msg-3".to_string(),
            DeadLetterReason::MaxDeliveryCountExceeded
        )]
    );
}

#[tokio::test]
async fn test_non_retryable_failure_dead_letters_on_first_delivery() {
    for error in [
        "Execution timed out: maximum duration of 1s exceeded",
        "Failed to deserialize sandbox response: expected value",
        "model endpoint returned 401 Unauthorized",
        "resource not found",
    ] {
        let connector = Arc::new(RecordingConnector::default());
        let executor = ScriptedExecutor::new(Behaviour::FailWith(error));
        let processor = processor(10, &connector, &executor);

        processor
            .process_message(message(1), &CancellationToken::new())
            .await;

        assert_eq!(
            connector.calls(),
            vec![Call::DeadLetter(
                "msg-1".to_string(),
                DeadLetterReason::NonRetryableError
            )],
            "error {:?}",
            error
        );
    }
}

#[tokio::test]
async fn test_retryable_failure_below_limit_abandons_once() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::FailWith("rate limited by provider"));
    let processor = processor(5, &connector, &executor);

    let disposition = processor
        .process_message(message(2), &CancellationToken::new())
        .await;

    assert_eq!(disposition, Disposition::Abandoned);
    assert_eq!(connector.calls(), vec![Call::Abandon("msg-2".to_string())]);
}

#[tokio::test]
async fn test_success_completes() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let processor = processor(5, &connector, &executor);

    let disposition = processor
        .process_message(message(1), &CancellationToken::new())
        .await;

    assert_eq!(disposition, Disposition::Completed);
    assert_eq!(connector.calls(), vec![Call::Complete("msg-1".to_string())]);
}

#[tokio::test]
async fn test_executor_error_abandons() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Error);
    let processor = processor(5, &connector, &executor);

    processor
        .process_message(message(5), &CancellationToken::new())
        .await;

    assert_eq!(connector.calls(), vec![Call::Abandon("msg-5".to_string())]);
}

#[tokio::test]
async fn test_executor_panic_abandons() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Panic);
    let processor = processor(5, &connector, &executor);

    let disposition = processor
        .process_message(message(1), &CancellationToken::new())
        .await;

    assert_eq!(disposition, Disposition::Abandoned);
    assert_eq!(connector.calls(), vec![Call::Abandon("msg-1".to_string())]);
}

// =============================================================================
// Result publishing
// =============================================================================

#[tokio::test]
async fn test_success_is_published_with_message_id_and_correlation() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let output = FixedOutput::new(SendMessageResult::delivered(200, None));
    let processor = processor(5, &connector, &executor).with_output(output.clone());

    processor
        .process_message(message(1), &CancellationToken::new())
        .await;

    let sent = output.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, "msg-1");
    assert_eq!(sent[0].body, "echo: hello");
    assert_eq!(sent[0].correlation_id.as_deref(), Some("corr-7"));
    assert_eq!(connector.calls(), vec![Call::Complete("msg-1".to_string())]);
}

#[tokio::test]
async fn test_retryable_publish_failure_abandons() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let output = FixedOutput::new(SendMessageResult::failed(
        "Endpoint returned 503 Service Unavailable",
        Some(503),
        true,
    ));
    let processor = processor(5, &connector, &executor).with_output(output);

    processor
        .process_message(message(1), &CancellationToken::new())
        .await;

    assert_eq!(connector.calls(), vec![Call::Abandon("msg-1".to_string())]);
}

#[tokio::test]
async fn test_rejected_publish_dead_letters() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let output = FixedOutput::new(SendMessageResult::failed(
        "Endpoint returned 400 Bad Request",
        Some(400),
        false,
    ));
    let processor = processor(5, &connector, &executor).with_output(output);

    processor
        .process_message(message(1), &CancellationToken::new())
        .await;

    assert_eq!(
        connector.calls(),
        vec![Call::DeadLetter(
            "msg-1".to_string(),
            DeadLetterReason::NonRetryableError
        )]
    );
}

#[tokio::test]
async fn test_publish_cancelled_at_max_delivery_abandons() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let output = FixedOutput::new(SendMessageResult::failed(
        "Delivery cancelled",
        None,
        true,
    ));
    let processor = processor(1, &connector, &executor).with_output(output);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let disposition = processor.process_message(message(1), &cancel).await;

    assert_eq!(disposition, Disposition::Abandoned);
    assert_eq!(connector.calls(), vec![Call::Abandon("msg-1".to_string())]);
}

#[tokio::test]
async fn test_failure_during_shutdown_abandons_at_max_delivery() {
    let connector = Arc::new(RecordingConnector::default());
    let executor = ScriptedExecutor::new(Behaviour::FailWith("Execution timed out"));
    let processor = processor(2, &connector, &executor);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let disposition = processor.process_message(message(2), &cancel).await;

    assert_eq!(disposition, Disposition::Abandoned);
    assert_eq!(connector.calls(), vec![Call::Abandon("msg-2".to_string())]);
}

// =============================================================================
// End to end with the in-memory queue
// =============================================================================

#[tokio::test]
async fn test_queue_redelivers_until_poison() {
    let queue = Arc::new(InMemoryQueue::new());
    let id = queue.enqueue("flaky").await;
    let executor = ScriptedExecutor::new(Behaviour::FailWith("connection refused"));
    let processor = MessageProcessor::new(config(3), queue.clone(), executor.clone());

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    };
    let stopper = async {
        for _ in 0..100 {
            if !queue.dead_letters().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
    };
    tokio::join!(run, stopper);

    // Deliveries 1 and 2 abandon, delivery 3 reaches the limit.
    assert_eq!(executor.calls(), 3);
    let letters = queue.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, id);
    assert_eq!(letters[0].reason, DeadLetterReason::MaxDeliveryCountExceeded);
    assert_eq!(queue.ready_len().await, 0);
    assert_eq!(queue.locked_len().await, 0);
}

#[tokio::test]
async fn test_queue_batch_completes_every_message() {
    let queue = Arc::new(InMemoryQueue::new());
    for i in 0..5 {
        queue.enqueue(format!("job-{}", i)).await;
    }
    let executor = ScriptedExecutor::new(Behaviour::Succeed);
    let processor =
        MessageProcessor::new(config(3).with_max_messages(2), queue.clone(), executor.clone());

    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        async move { processor.run(shutdown).await }
    };
    let stopper = async {
        for _ in 0..100 {
            if queue.completed().await.len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
    };
    tokio::join!(run, stopper);

    assert_eq!(executor.calls(), 5);
    assert_eq!(queue.completed().await.len(), 5);
    assert!(queue.dead_letters().await.is_empty());
}
