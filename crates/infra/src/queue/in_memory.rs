use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DeliveryOptions, JobQueue, QueueConsumer, QueueCounts, QueueError, QueueMessage, QueueTask};

#[derive(Debug)]
struct Waiting {
    message: QueueMessage,
    not_before: Instant,
    seq: u64,
}

/// How many accepted and failed messages are kept for inspection by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Default)]
struct State {
    seq: u64,
    closed: bool,
    waiting: Vec<Waiting>,
    active: HashMap<String, QueueMessage>,
    failed_total: u64,
    failed: VecDeque<(QueueMessage, String)>,
    accepted: VecDeque<QueueMessage>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    while buf.len() >= limit {
        buf.pop_front();
    }
    buf.push_back(item);
}

/// In-memory queue for tests/dev.
///
/// Waiting messages are served by priority (1 first), FIFO within a priority,
/// skipping messages whose retry delay has not elapsed. Only the most recent
/// accepted and failed messages are retained for inspection.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    history_limit: usize,
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_history(name, DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` accepted and `limit` failed messages.
    pub fn with_history(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            history_limit: limit,
            state: Mutex::new(State::default()),
        }
    }

    /// Most recently accepted messages, oldest first.
    pub fn messages(&self) -> Vec<QueueMessage> {
        self.state
            .lock()
            .map(|s| s.accepted.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent messages that were given up on, with the reason.
    pub fn failures(&self) -> Vec<(QueueMessage, String)> {
        self.state
            .lock()
            .map(|s| s.failed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Reject all further enqueues with `QueueError::Closed`.
    pub fn close(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.closed = true;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Command("lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, task: QueueTask, options: DeliveryOptions) -> Result<String, QueueError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.seq += 1;
        let seq = state.seq;
        let message = QueueMessage {
            id: format!("{}-{seq}", self.name),
            task,
            options,
            attempts_made: 0,
        };
        push_bounded(&mut state.accepted, message.clone(), self.history_limit);
        state.waiting.push(Waiting {
            message: message.clone(),
            not_before: Instant::now(),
            seq,
        });
        Ok(message.id)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.lock()?;
        Ok(QueueCounts {
            active: state.active.len() as u64,
            waiting: state.waiting.len() as u64,
            failed: state.failed_total,
        })
    }
}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    async fn reserve(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let next = state
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| w.not_before <= now)
            .min_by_key(|(_, w)| (w.message.options.priority, w.seq))
            .map(|(idx, _)| idx);

        let Some(idx) = next else {
            return Ok(None);
        };
        let mut message = state.waiting.remove(idx).message;
        message.attempts_made += 1;
        state.active.insert(message.id.clone(), message.clone());
        Ok(Some(message))
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.lock()?.active.remove(&message.id);
        Ok(())
    }

    async fn retry_later(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.active.remove(&message.id);
        state.seq += 1;
        let seq = state.seq;
        state.waiting.push(Waiting {
            message: message.clone(),
            not_before: Instant::now() + delay,
            seq,
        });
        Ok(())
    }

    async fn fail(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.active.remove(&message.id);
        state.failed_total += 1;
        push_bounded(&mut state.failed, (message.clone(), reason.to_string()), self.history_limit);
        Ok(())
    }
}
