use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::connector::{
    AckContext, CompletionResult, DeadLetterReason, InputConnector, ReceivedMessage,
};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    body: String,
    correlation_id: Option<String>,
    /// Deliveries handed out so far
    delivery_count: u32,
    enqueued_time: DateTime<Utc>,
}

#[derive(Debug)]
struct Locked {
    message: Stored,
    locked_until: Instant,
}

/// A message set aside by [`InputConnector::dead_letter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetteredMessage {
    pub message_id: String,
    pub body: String,
    pub delivery_count: u32,
    pub reason: DeadLetterReason,
    pub description: String,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    locked: HashMap<AckContext, Locked>,
    completed: Vec<String>,
    dead_letters: Vec<DeadLetteredMessage>,
}

impl QueueState {
    /// Return messages whose lock ran out to the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<AckContext> = self
            .locked
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(ctx, _)| *ctx)
            .collect();
        for ctx in expired {
            if let Some(locked) = self.locked.remove(&ctx) {
                tracing::debug!(message_id = %locked.message.message_id, "Message lock expired");
                self.ready.push_front(locked.message);
            }
        }
    }
}

/// Poll-based queue with peek-lock semantics.
///
/// Received messages stay locked until disposed or until the lock duration
/// passes, after which they become visible again with a higher delivery
/// count. A disposition whose lock is no longer held is refused.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    available: Notify,
    lock_duration: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_lock_duration(Duration::from_secs(60))
    }

    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            lock_duration,
        }
    }

    /// Enqueue a body and return its message id.
    pub async fn enqueue(&self, body: impl Into<String>) -> String {
        self.enqueue_with_correlation(body, None).await
    }

    pub async fn enqueue_with_correlation(
        &self,
        body: impl Into<String>,
        correlation_id: Option<String>,
    ) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.state.lock().await.ready.push_back(Stored {
            message_id: message_id.clone(),
            body: body.into(),
            correlation_id,
            delivery_count: 0,
            enqueued_time: Utc::now(),
        });
        self.available.notify_one();
        message_id
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn locked_len(&self) -> usize {
        self.state.lock().await.locked.len()
    }

    pub async fn completed(&self) -> Vec<String> {
        self.state.lock().await.completed.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.state.lock().await.dead_letters.clone()
    }

    async fn take_lock(&self, ctx: AckContext) -> std::result::Result<Stored, CompletionResult> {
        let mut state = self.state.lock().await;
        match state.locked.remove(&ctx) {
            Some(locked) if locked.locked_until > Instant::now() => Ok(locked.message),
            Some(locked) => {
                state.ready.push_front(locked.message);
                self.available.notify_one();
                Err(CompletionResult::failed("Message lock expired"))
            }
            None => Err(CompletionResult::failed("Message lock not held")),
        }
    }
}

#[async_trait]
impl InputConnector for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let available = self.available.notified();
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                let mut batch = Vec::new();
                while batch.len() < max_messages {
                    let Some(mut message) = state.ready.pop_front() else {
                        break;
                    };
                    message.delivery_count += 1;
                    let ctx = AckContext(Uuid::new_v4());
                    batch.push(ReceivedMessage {
                        message_id: message.message_id.clone(),
                        body: message.body.clone(),
                        correlation_id: message.correlation_id.clone(),
                        delivery_count: message.delivery_count,
                        enqueued_time: message.enqueued_time,
                        ack_context: ctx,
                    });
                    state.locked.insert(
                        ctx,
                        Locked {
                            message,
                            locked_until: now + self.lock_duration,
                        },
                    );
                }
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, available).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, message: ReceivedMessage) -> CompletionResult {
        match self.take_lock(message.ack_context).await {
            Ok(stored) => {
                self.state.lock().await.completed.push(stored.message_id);
                CompletionResult::ok()
            }
            Err(refused) => refused,
        }
    }

    async fn abandon(&self, message: ReceivedMessage) -> CompletionResult {
        match self.take_lock(message.ack_context).await {
            Ok(stored) => {
                self.state.lock().await.ready.push_back(stored);
                self.available.notify_one();
                CompletionResult::ok()
            }
            Err(refused) => refused,
        }
    }

    async fn dead_letter(
        &self,
        message: ReceivedMessage,
        reason: DeadLetterReason,
        description: String,
    ) -> CompletionResult {
        match self.take_lock(message.ack_context).await {
            Ok(stored) => {
                self.state.lock().await.dead_letters.push(DeadLetteredMessage {
                    message_id: stored.message_id,
                    body: stored.body,
                    delivery_count: stored.delivery_count,
                    reason,
                    description,
                });
                CompletionResult::ok()
            }
            Err(refused) => refused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let queue = InMemoryQueue::new();
        let started = std::time::Instant::now();
        let batch = queue.receive(5, WAIT).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn receive_respects_batch_size_and_locks() {
        let queue = InMemoryQueue::new();
        for i in 0..3 {
            queue.enqueue(format!("m{}", i)).await;
        }
        let batch = queue.receive(2, WAIT).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|m| m.delivery_count == 1));
        assert_eq!(queue.locked_len().await, 2);
        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn receive_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("late").await;
        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test]
    async fn abandon_redelivers_with_higher_count() {
        let queue = InMemoryQueue::new();
        let id = queue
            .enqueue_with_correlation("work", Some("corr-1".to_string()))
            .await;

        let first = queue.receive(1, WAIT).await.unwrap().remove(0);
        assert!(queue.abandon(first).await.success);

        let second = queue.receive(1, WAIT).await.unwrap().remove(0);
        assert_eq!(second.message_id, id);
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.correlation_id.as_deref(), Some("corr-1"));
    }

    #[tokio::test]
    async fn second_disposition_is_refused() {
        let queue = InMemoryQueue::new();
        queue.enqueue("once").await;
        let message = queue.receive(1, WAIT).await.unwrap().remove(0);
        let copy = message.clone();

        assert!(queue.complete(message).await.success);
        let refused = queue.abandon(copy).await;
        assert!(!refused.success);
        assert_eq!(queue.completed().await.len(), 1);
        assert_eq!(queue.ready_len().await, 0);
    }

    #[tokio::test]
    async fn dead_letter_records_reason() {
        let queue = InMemoryQueue::new();
        queue.enqueue("bad").await;
        let message = queue.receive(1, WAIT).await.unwrap().remove(0);
        let result = queue
            .dead_letter(
                message,
                DeadLetterReason::NonRetryableError,
                "format error".to_string(),
            )
            .await;
        assert!(result.success);

        let letters = queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::NonRetryableError);
        assert_eq!(letters[0].description, "format error");
        assert_eq!(letters[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn expired_lock_makes_message_visible_again() {
        let queue = InMemoryQueue::with_lock_duration(Duration::from_millis(20));
        queue.enqueue("slow").await;
        let stale = queue.receive(1, WAIT).await.unwrap().remove(0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = queue.receive(1, WAIT).await.unwrap().remove(0);
        assert_eq!(again.delivery_count, 2);

        // The first delivery lost its lock and can no longer be disposed.
        assert!(!queue.complete(stale).await.success);
        assert!(queue.complete(again).await.success);
    }
}
