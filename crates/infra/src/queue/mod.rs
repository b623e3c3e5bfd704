//! Queue dispatch: one logical task queue per job type.
//!
//! Producers (the job service) only need [`JobQueue`]; in-process workers use
//! [`QueueConsumer`] to reserve and settle messages.
//!
//! ## Backends
//!
//! - `InMemoryQueue`: tests/dev, priority ordered, records every message
//! - `RedisStreamsQueue` (feature `redis`): one stream per topic

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use genflow_core::{JobId, JobType};

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

/// Highest priority (processed first).
pub const PRIORITY_HIGHEST: u8 = 1;
/// Lowest priority.
pub const PRIORITY_LOWEST: u8 = 10;

/// Upper bound on a single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Message body handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTask {
    pub job_id: JobId,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
}

/// Retry backoff as it appears on the wire: `{"type": "exponential", "delay": ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl Backoff {
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: delay.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Retry policy attached to every dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(5000))
    }
}

impl RetryPolicy {
    pub fn exponential(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::exponential(delay),
        }
    }

    /// Delay before retrying after the given (1-indexed) failed attempt:
    /// `delay * 2^(attempt-1)`, capped at [`MAX_BACKOFF`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u64.saturating_pow(attempt - 1);
        let ms = self.backoff.delay_ms.saturating_mul(factor);
        Duration::from_millis(ms).min(MAX_BACKOFF)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts
    }
}

/// Per-message delivery options: `{priority, attempts, backoff}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// 1 (highest) to 10 (lowest).
    pub priority: u8,
    pub attempts: u32,
    pub backoff: Backoff,
}

impl DeliveryOptions {
    /// Options for `policy`, with `priority` clamped into range.
    pub fn new(priority: u8, policy: RetryPolicy) -> Self {
        Self {
            priority: priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST),
            attempts: policy.attempts,
            backoff: policy.backoff,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            backoff: self.backoff,
        }
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub active: u64,
    pub waiting: u64,
    pub failed: u64,
}

/// A message reserved by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Backend message id.
    pub id: String,
    pub task: QueueTask,
    pub options: DeliveryOptions,
    /// Attempts made so far, including the current one.
    pub attempts_made: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),

    #[error("queue call timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue is closed")]
    Closed,
}

/// Producer side of a queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Topic name (the job type's wire name).
    fn name(&self) -> &str;

    /// Enqueue a task; returns once the backend durably accepted it, with the
    /// backend's message id.
    async fn enqueue(&self, task: QueueTask, options: DeliveryOptions) -> Result<String, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

/// Consumer side of a queue, for in-process workers.
#[async_trait]
pub trait QueueConsumer: JobQueue {
    /// Take the next due message, if any. The message becomes active until
    /// settled with one of the methods below.
    async fn reserve(&self) -> Result<Option<QueueMessage>, QueueError>;

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Put the message back, due after `delay`.
    async fn retry_later(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Give up on the message.
    async fn fail(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn enqueue(&self, task: QueueTask, options: DeliveryOptions) -> Result<String, QueueError> {
        (**self).enqueue(task, options).await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        (**self).counts().await
    }
}

#[async_trait]
impl<Q> QueueConsumer for Arc<Q>
where
    Q: QueueConsumer + ?Sized,
{
    async fn reserve(&self) -> Result<Option<QueueMessage>, QueueError> {
        (**self).reserve().await
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        (**self).complete(message).await
    }

    async fn retry_later(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        (**self).retry_later(message, delay).await
    }

    async fn fail(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        (**self).fail(message, reason).await
    }
}

/// One queue handle per job type, resolved once at startup.
#[derive(Debug, Clone)]
pub struct QueueSet<Q> {
    content_generation: Q,
    image_generation: Q,
    lora_training: Q,
    video_generation: Q,
}

impl<Q> QueueSet<Q> {
    pub fn from_fn(mut make: impl FnMut(JobType) -> Q) -> Self {
        Self {
            content_generation: make(JobType::ContentGeneration),
            image_generation: make(JobType::ImageGeneration),
            lora_training: make(JobType::LoraTraining),
            video_generation: make(JobType::VideoGeneration),
        }
    }

    pub fn try_from_fn<E>(mut make: impl FnMut(JobType) -> Result<Q, E>) -> Result<Self, E> {
        Ok(Self {
            content_generation: make(JobType::ContentGeneration)?,
            image_generation: make(JobType::ImageGeneration)?,
            lora_training: make(JobType::LoraTraining)?,
            video_generation: make(JobType::VideoGeneration)?,
        })
    }

    pub fn get(&self, job_type: JobType) -> &Q {
        match job_type {
            JobType::ContentGeneration => &self.content_generation,
            JobType::ImageGeneration => &self.image_generation,
            JobType::LoraTraining => &self.lora_training,
            JobType::VideoGeneration => &self.video_generation,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobType, &Q)> {
        JobType::ALL.into_iter().map(move |t| (t, self.get(t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_policy_is_three_attempts_with_five_second_backoff() {
        let p = RetryPolicy::default();
        assert_eq!(p.attempts, 3);
        assert_eq!(p.backoff.kind, BackoffKind::Exponential);
        assert_eq!(p.backoff.delay(), Duration::from_millis(5000));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(20_000));
        assert_eq!(p.delay_for_attempt(40), MAX_BACKOFF);
    }

    #[test]
    fn attempts_never_drop_below_one() {
        let p = RetryPolicy::exponential(0, Duration::from_millis(10));
        assert_eq!(p.attempts, 1);
        assert!(p.should_retry(0));
        assert!(!p.should_retry(1));
    }

    #[test]
    fn delivery_options_clamp_priority_and_match_wire_shape() {
        let opts = DeliveryOptions::new(42, RetryPolicy::default());
        assert_eq!(opts.priority, PRIORITY_LOWEST);
        assert_eq!(DeliveryOptions::new(0, RetryPolicy::default()).priority, PRIORITY_HIGHEST);

        let wire = serde_json::to_value(opts).unwrap();
        assert_eq!(
            wire,
            json!({"priority": 10, "attempts": 3, "backoff": {"type": "exponential", "delay": 5000}})
        );
    }

    #[test]
    fn queue_set_maps_every_type_to_its_own_queue() {
        let set = QueueSet::from_fn(|t| t.as_str().to_string());
        for (t, name) in set.iter() {
            assert_eq!(name, t.as_str());
        }
        assert_eq!(set.get(JobType::LoraTraining), "lora-training");
    }
}
