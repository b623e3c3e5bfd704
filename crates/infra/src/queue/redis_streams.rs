//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Layout per topic
//!
//! - **Stream**: `genflow:queue:<topic>`, one entry per waiting/active task
//!   with fields `jobId`, `payload`, `priority`, `attempts`, `backoff`,
//!   `attemptsMade`
//! - **Consumer group**: `genflow-workers` (created on first use with MKSTREAM)
//! - **Delayed set**: `genflow:queue:<topic>:delayed`, sorted by due time;
//!   retried tasks wait here and are moved back onto the stream when due
//! - **Dead-letter stream**: `genflow:queue:<topic>:dlq`
//!
//! Moves between the stream, the delayed set and the dead-letter stream are
//! single MULTI/EXEC transactions (or one script), so a task is never in
//! neither place. Entries left pending by a consumer that died are reclaimed
//! with XAUTOCLAIM once idle for the claim timeout.
//!
//! Streams are FIFO; `priority` is carried for out-of-process workers but not
//! used for ordering here. Every call is bounded by the client timeout.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use genflow_core::{JobId, timestamp};

use super::{
    Backoff, DeliveryOptions, JobQueue, QueueConsumer, QueueCounts, QueueError, QueueMessage,
    QueueTask,
};

const STREAM_PREFIX: &str = "genflow:queue";
const DEFAULT_GROUP: &str = "genflow-workers";
const PROMOTE_BATCH: usize = 16;
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// Re-queue one delayed member. Only the caller whose ZREM removed it appends.
/// KEYS: delayed set, stream. ARGV: member, then field/value pairs.
const PROMOTE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return false
end
local fields = {}
for i = 2, #ARGV do
  fields[#fields + 1] = ARGV[i]
end
return redis.call('XADD', KEYS[2], '*', unpack(fields))
"#;

type ReadReply = Option<Vec<(String, Vec<(String, HashMap<String, String>)>)>>;
type Fields = Vec<(&'static str, String)>;

/// Task as parked in the delayed set.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Parked {
    task: QueueTask,
    options: DeliveryOptions,
    attempts_made: u32,
}

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<MultiplexedConnection>>,
    group_ready: Arc<OnceCell<()>>,
    topic: String,
    stream_key: String,
    delayed_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    timeout: Duration,
    claim_idle: Duration,
}

impl RedisStreamsQueue {
    /// Queue for `topic`. No connection is made until the first call.
    pub fn new(redis_url: impl AsRef<str>, topic: impl Into<String>, timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self::with_client(Arc::new(client), topic, timeout))
    }

    /// Queue sharing an existing client.
    pub fn with_client(client: Arc<redis::Client>, topic: impl Into<String>, timeout: Duration) -> Self {
        let topic = topic.into();
        let stream_key = format!("{STREAM_PREFIX}:{topic}");
        Self {
            client,
            conn: Arc::new(OnceCell::new()),
            group_ready: Arc::new(OnceCell::new()),
            delayed_key: format!("{stream_key}:delayed"),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            topic,
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            timeout,
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    pub fn with_consumer(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    /// Pending entries idle for longer than `idle` are reclaimed by `reserve`.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, QueueError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| QueueError::Timeout(self.timeout))?
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }

    /// Ensure the consumer group exists (idempotent).
    async fn ensure_group(&self, conn: &MultiplexedConnection) -> Result<(), QueueError> {
        let mut conn = conn.clone();
        self.group_ready
            .get_or_try_init(|| async move {
                let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg("0")
                    .arg("MKSTREAM")
                    .query_async(&mut conn)
                    .await;
                match created {
                    Ok(_) => Ok(()),
                    Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                    Err(e) => Err(command_error("XGROUP CREATE", e)),
                }
            })
            .await?;
        Ok(())
    }

    fn append_cmd(&self, fields: &Fields) -> redis::Cmd {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(value);
        }
        cmd
    }

    /// ZADD to the delayed set, then ack and drop the stream entry, atomically.
    fn retry_pipeline(&self, message_id: &str, due_ms: i64, parked: &str) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due_ms)
            .arg(parked)
            .ignore();
        self.push_settle(&mut pipe, message_id);
        pipe
    }

    /// XADD to the dead-letter stream, then ack and drop the entry, atomically.
    fn dead_letter_pipeline(&self, message_id: &str, fields: &Fields) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("XADD").arg(&self.dlq_key).arg("*");
        pipe.arg("originalMessageId").arg(message_id);
        for (name, value) in fields {
            pipe.arg(*name).arg(value);
        }
        pipe.ignore();
        self.push_settle(&mut pipe, message_id);
        pipe
    }

    fn settle_pipeline(&self, message_id: &str) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.push_settle(&mut pipe, message_id);
        pipe
    }

    fn push_settle(&self, pipe: &mut redis::Pipeline, message_id: &str) {
        pipe.cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(message_id)
            .ignore();
    }

    /// Take over one entry another consumer left pending for too long.
    fn claim_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1);
        cmd
    }

    /// Move due tasks from the delayed set back onto the stream.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        for member in due {
            let fields = match serde_json::from_str::<Parked>(&member)
                .map_err(|e| QueueError::Serialization(e.to_string()))
                .and_then(|p| entry_fields(&p.task, &p.options, p.attempts_made))
            {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "dead-lettering unreadable delayed task");
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("ZREM")
                        .arg(&self.delayed_key)
                        .arg(&member)
                        .ignore()
                        .cmd("XADD")
                        .arg(&self.dlq_key)
                        .arg("*")
                        .arg("raw")
                        .arg(&member)
                        .arg("reason")
                        .arg(e.to_string())
                        .ignore();
                    pipe.query_async::<_, ()>(conn)
                        .await
                        .map_err(|e| command_error("delayed DLQ", e))?;
                    continue;
                }
            };

            let script = redis::Script::new(PROMOTE_SCRIPT);
            let mut invocation = script.prepare_invoke();
            invocation.key(&self.delayed_key).key(&self.stream_key).arg(&member);
            for (name, value) in &fields {
                invocation.arg(*name).arg(value);
            }
            let added: Option<String> = invocation
                .invoke_async(conn)
                .await
                .map_err(|e| command_error("promote", e))?;
            if let Some(id) = added {
                debug!(topic = %self.topic, message_id = %id, "promoted delayed task");
            }
        }
        Ok(())
    }

    /// Dead-letter an entry that cannot be decoded so it leaves the PEL.
    async fn discard_unreadable(
        &self,
        conn: &mut MultiplexedConnection,
        message_id: &str,
        raw: &HashMap<String, String>,
        error: &QueueError,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(raw).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let fields: Fields = vec![
            ("raw", raw),
            ("reason", error.to_string()),
            ("failedAt", timestamp::format(&chrono::Utc::now())),
        ];
        self.dead_letter_pipeline(message_id, &fields)
            .query_async::<_, ()>(conn)
            .await
            .map_err(|e| command_error("DLQ XADD", e))?;
        warn!(topic = %self.topic, message_id, error = %error, "unreadable entry sent to dead-letter stream");
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.topic
    }

    #[instrument(skip(self, task, options), fields(topic = %self.topic, job_id = %task.job_id), err)]
    async fn enqueue(&self, task: QueueTask, options: DeliveryOptions) -> Result<String, QueueError> {
        let fields = entry_fields(&task, &options, 0)?;
        self.bounded(async {
            let mut conn = self.connection().await?;
            self.append_cmd(&fields)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("XADD", e))
        })
        .await
    }

    #[instrument(skip(self), fields(topic = %self.topic), err)]
    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            self.ensure_group(&conn).await?;

            let (len, pending, delayed, failed): (u64, redis::Value, u64, u64) = redis::pipe()
                .cmd("XLEN")
                .arg(&self.stream_key)
                .cmd("XPENDING")
                .arg(&self.stream_key)
                .arg(&self.group)
                .cmd("ZCARD")
                .arg(&self.delayed_key)
                .cmd("XLEN")
                .arg(&self.dlq_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("counts", e))?;

            let active = pending_count(&pending);
            Ok(QueueCounts {
                active,
                waiting: len.saturating_sub(active) + delayed,
                failed,
            })
        })
        .await
    }
}

#[async_trait]
impl QueueConsumer for RedisStreamsQueue {
    async fn reserve(&self) -> Result<Option<QueueMessage>, QueueError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            self.ensure_group(&conn).await?;
            self.promote_due(&mut conn).await?;

            let claimed: redis::Value = self
                .claim_cmd()
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("XAUTOCLAIM", e))?;

            let entry = match claimed_entry(claimed) {
                Some(entry) => {
                    debug!(topic = %self.topic, message_id = %entry.0, "reclaimed stalled entry");
                    Some(entry)
                }
                None => {
                    let reply: ReadReply = redis::cmd("XREADGROUP")
                        .arg("GROUP")
                        .arg(&self.group)
                        .arg(&self.consumer)
                        .arg("COUNT")
                        .arg(1)
                        .arg("STREAMS")
                        .arg(&self.stream_key)
                        .arg(">")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| command_error("XREADGROUP", e))?;
                    reply
                        .into_iter()
                        .flatten()
                        .flat_map(|(_, entries)| entries)
                        .next()
                }
            };

            let Some((id, fields)) = entry else {
                return Ok(None);
            };
            match parse_entry(id.clone(), &fields) {
                Ok(message) => Ok(Some(message)),
                Err(e) => {
                    self.discard_unreadable(&mut conn, &id, &fields, &e).await?;
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            self.settle_pipeline(&message.id)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| command_error("XACK/XDEL", e))
        })
        .await
    }

    async fn retry_later(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let parked = serde_json::to_string(&Parked {
            task: message.task.clone(),
            options: message.options,
            attempts_made: message.attempts_made,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;

        self.bounded(async {
            let mut conn = self.connection().await?;
            self.retry_pipeline(&message.id, due_ms, &parked)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| command_error("retry", e))
        })
        .await
    }

    async fn fail(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let fields: Fields = vec![
            ("jobId", message.task.job_id.to_string()),
            ("attemptsMade", message.attempts_made.to_string()),
            ("reason", reason.to_string()),
            ("failedAt", timestamp::format(&chrono::Utc::now())),
        ];
        self.bounded(async {
            let mut conn = self.connection().await?;
            self.dead_letter_pipeline(&message.id, &fields)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| command_error("DLQ XADD", e))?;
            warn!(topic = %self.topic, job_id = %message.task.job_id, reason, "task sent to dead-letter stream");
            Ok(())
        })
        .await
    }
}

/// Stream entry fields for a task.
fn entry_fields(task: &QueueTask, options: &DeliveryOptions, attempts_made: u32) -> Result<Fields, QueueError> {
    let payload = serde_json::to_string(&task.payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
    let backoff = serde_json::to_string(&options.backoff).map_err(|e| QueueError::Serialization(e.to_string()))?;
    Ok(vec![
        ("jobId", task.job_id.to_string()),
        ("payload", payload),
        ("priority", options.priority.to_string()),
        ("attempts", options.attempts.to_string()),
        ("backoff", backoff),
        ("attemptsMade", attempts_made.to_string()),
    ])
}

fn command_error(command: &str, err: redis::RedisError) -> QueueError {
    if err.is_connection_dropped() || err.is_io_error() {
        QueueError::Connection(format!("{command} failed: {err}"))
    } else {
        QueueError::Command(format!("{command} failed: {err}"))
    }
}

/// Total from an XPENDING summary reply (`[count, min, max, consumers]`).
fn pending_count(reply: &redis::Value) -> u64 {
    match reply {
        redis::Value::Bulk(items) => match items.first() {
            Some(redis::Value::Int(n)) => (*n).max(0) as u64,
            _ => 0,
        },
        _ => 0,
    }
}

/// First entry of an XAUTOCLAIM reply (`[next, [[id, fields]...], deleted?]`).
/// Entries whose stream data was already deleted are skipped.
fn claimed_entry(reply: redis::Value) -> Option<(String, HashMap<String, String>)> {
    let redis::Value::Bulk(parts) = reply else {
        return None;
    };
    let Some(redis::Value::Bulk(entries)) = parts.into_iter().nth(1) else {
        return None;
    };
    entries
        .iter()
        .find_map(|entry| redis::from_redis_value::<(String, HashMap<String, String>)>(entry).ok())
}

fn parse_entry(id: String, fields: &HashMap<String, String>) -> Result<QueueMessage, QueueError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::Serialization(format!("entry {id} is missing {name}")))
    };
    let bad = |name: &str| QueueError::Serialization(format!("entry {id} has an invalid {name}"));

    let job_id = JobId::from_str(field("jobId")?).map_err(|_| bad("jobId"))?;
    let payload = serde_json::from_str(field("payload")?).map_err(|_| bad("payload"))?;
    let priority = field("priority")?.parse().map_err(|_| bad("priority"))?;
    let attempts = field("attempts")?.parse().map_err(|_| bad("attempts"))?;
    let backoff: Backoff = serde_json::from_str(field("backoff")?).map_err(|_| bad("backoff"))?;
    let attempts_made: u32 = fields
        .get("attemptsMade")
        .map(|v| v.parse().map_err(|_| bad("attemptsMade")))
        .transpose()?
        .unwrap_or(0);

    Ok(QueueMessage {
        id: id.clone(),
        task: QueueTask { job_id, payload },
        options: DeliveryOptions {
            priority,
            attempts,
            backoff,
        },
        attempts_made: attempts_made + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;

    #[test]
    fn keys_follow_the_topic() {
        let q = RedisStreamsQueue::new("redis://127.0.0.1:6379", "lora-training", Duration::from_secs(1)).unwrap();
        assert_eq!(q.stream_key(), "genflow:queue:lora-training");
        assert_eq!(q.name(), "lora-training");
    }

    #[test]
    fn entries_parse_into_messages() {
        let job_id = JobId::new();
        let backoff = serde_json::to_string(&RetryPolicy::default().backoff).unwrap();
        let fields: HashMap<String, String> = [
            ("jobId", job_id.to_string()),
            ("payload", r#"{"prompt":"hi"}"#.to_string()),
            ("priority", "5".to_string()),
            ("attempts", "3".to_string()),
            ("backoff", backoff),
            ("attemptsMade", "1".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let m = parse_entry("1-0".to_string(), &fields).unwrap();
        assert_eq!(m.task.job_id, job_id);
        assert_eq!(m.options.attempts, 3);
        assert_eq!(m.options.backoff.delay_ms, 5000);
        assert_eq!(m.attempts_made, 2);
    }

    #[test]
    fn missing_fields_are_serialization_errors() {
        let err = parse_entry("1-0".to_string(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    fn queue() -> RedisStreamsQueue {
        RedisStreamsQueue::new("redis://127.0.0.1:6379", "image-generation", Duration::from_secs(1))
            .unwrap()
            .with_consumer("genflow-workers", "worker-a")
            .with_claim_idle(Duration::from_secs(30))
    }

    fn packed(bytes: Vec<u8>) -> String {
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack.find(needle).unwrap_or_else(|| panic!("{needle} not in {haystack:?}"))
    }

    #[test]
    fn retry_parks_before_acking_inside_one_transaction() {
        let q = queue();
        let wire = packed(q.retry_pipeline("1-0", 1_700_000_000_000, "{}").get_packed_pipeline());

        let multi = position(&wire, "MULTI");
        let zadd = position(&wire, "ZADD");
        let xack = position(&wire, "XACK");
        let xdel = position(&wire, "XDEL");
        let exec = position(&wire, "EXEC");
        assert!(multi < zadd && zadd < xack && xack < xdel && xdel < exec);
        assert!(wire.contains("genflow:queue:image-generation:delayed"));
    }

    #[test]
    fn dead_letter_writes_before_acking_inside_one_transaction() {
        let q = queue();
        let fields: Fields = vec![("reason", "boom".to_string())];
        let wire = packed(q.dead_letter_pipeline("7-1", &fields).get_packed_pipeline());

        let multi = position(&wire, "MULTI");
        let dlq = position(&wire, "genflow:queue:image-generation:dlq");
        let xack = position(&wire, "XACK");
        let exec = position(&wire, "EXEC");
        assert!(multi < dlq && dlq < xack && xack < exec);
        assert!(wire.contains("originalMessageId"));
        assert!(wire.contains("boom"));
    }

    #[test]
    fn claim_uses_the_idle_timeout_and_this_consumer() {
        let wire = packed(queue().claim_cmd().get_packed_command());
        let claim = position(&wire, "XAUTOCLAIM");
        let consumer = position(&wire, "worker-a");
        let idle = position(&wire, "30000");
        assert!(claim < consumer && consumer < idle);
        assert!(wire.contains("COUNT"));
    }

    #[test]
    fn promote_script_removes_before_appending() {
        let zrem = position(PROMOTE_SCRIPT, "ZREM");
        let xadd = position(PROMOTE_SCRIPT, "XADD");
        assert!(zrem < xadd);
    }

    #[test]
    fn claimed_entries_are_read_from_the_reply() {
        let data = |s: &str| redis::Value::Data(s.as_bytes().to_vec());
        let reply = redis::Value::Bulk(vec![
            data("0-0"),
            redis::Value::Bulk(vec![redis::Value::Bulk(vec![
                data("5-0"),
                redis::Value::Bulk(vec![data("jobId"), data("abc")]),
            ])]),
            redis::Value::Bulk(vec![]),
        ]);

        let (id, fields) = claimed_entry(reply).unwrap();
        assert_eq!(id, "5-0");
        assert_eq!(fields.get("jobId").map(String::as_str), Some("abc"));

        let empty = redis::Value::Bulk(vec![data("0-0"), redis::Value::Bulk(vec![])]);
        assert!(claimed_entry(empty).is_none());
    }

    #[test]
    fn entry_fields_round_trip_through_parse() {
        let task = QueueTask {
            job_id: JobId::new(),
            payload: serde_json::json!({"n": 1}),
        };
        let options = DeliveryOptions::new(3, RetryPolicy::default());
        let fields: HashMap<String, String> = entry_fields(&task, &options, 2)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let m = parse_entry("9-0".to_string(), &fields).unwrap();
        assert_eq!(m.task, task);
        assert_eq!(m.options, options);
        assert_eq!(m.attempts_made, 3);
    }

    #[test]
    fn pending_summary_count_is_read() {
        let reply = redis::Value::Bulk(vec![redis::Value::Int(4), redis::Value::Nil]);
        assert_eq!(pending_count(&reply), 4);
        assert_eq!(pending_count(&redis::Value::Nil), 0);
    }
}
