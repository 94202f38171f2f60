//! Durable task queue for inbound callbacks.
//!
//! Tasks live in Redis under `mpesa:queue:<name>:*`:
//! `pending` is a list consumed with BLMOVE into `processing`, `leases` is a
//! sorted set of processing entries keyed by lease deadline in milliseconds,
//! `scheduled` is a sorted set of retries keyed by due time, and `archived`
//! is a bounded list of tasks that failed for good.
//!
//! An entry leaves `processing` only in the same MULTI that completes,
//! reschedules or archives it. Entries whose lease ran out are pushed back
//! onto `pending`, so a worker that dies mid-task loses nothing.

pub mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use worker::{TaskOutcome, WorkerPool};

pub const TYPE_PROCESS_CALLBACK: &str = "callback:process";
pub const DEFAULT_QUEUE: &str = "default";
pub const CALLBACK_MAX_RETRY: u32 = 3;
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

const KEY_PREFIX: &str = "mpesa:queue";
const ARCHIVE_LIMIT: isize = 10_000;
const PROMOTE_BATCH: isize = 100;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

// KEYS: scheduled, pending. ARGV: now_ms, batch.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, entry in ipairs(due) do
  redis.call('ZREM', KEYS[1], entry)
  redis.call('LPUSH', KEYS[2], entry)
end
return #due
";

// KEYS: processing, leases, pending. ARGV: now_ms, grace_deadline_ms.
// An entry without a lease was moved by a worker that has not written its
// lease yet, or that died in between. It gets a fresh one instead of being
// requeued on the spot.
const RECOVER_SCRIPT: &str = r"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
local recovered = 0
for _, entry in ipairs(entries) do
  local deadline = redis.call('ZSCORE', KEYS[2], entry)
  if not deadline then
    redis.call('ZADD', KEYS[2], 'NX', ARGV[2], entry)
  elseif tonumber(deadline) <= tonumber(ARGV[1]) then
    redis.call('LREM', KEYS[1], 1, entry)
    redis.call('ZREM', KEYS[2], entry)
    redis.call('RPUSH', KEYS[3], entry)
    recovered = recovered + 1
  end
end
return recovered
";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("task serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by a [`TaskHandler`]. Retryable failures go back to the
/// queue until the task's retry budget is spent; fatal ones are archived.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task kind this handler consumes.
    fn kind(&self) -> &'static str;

    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: String,
    pub queue: String,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub retried: u32,
    pub max_retry: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(kind: &str, queue: &str, payload: Vec<u8>, max_retry: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            queue: queue.to_string(),
            payload,
            retried: 0,
            max_retry,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// A raw upstream callback body, ready for the callback processor.
    pub fn callback(payload: Vec<u8>) -> Self {
        Self::new(TYPE_PROCESS_CALLBACK, DEFAULT_QUEUE, payload, CALLBACK_MAX_RETRY)
    }

    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }
}

/// A task checked out of `pending`. `receipt` is the entry exactly as stored,
/// which is what the queue needs to settle it.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task: Task,
    pub receipt: String,
}

/// Delay before retry number `retried + 1`: 10s doubling per retry, capped at
/// five minutes.
pub fn retry_delay(retried: u32) -> Duration {
    let factor = 2u32.saturating_pow(retried.min(16));
    BASE_RETRY_DELAY
        .checked_mul(factor)
        .map(|delay| delay.min(MAX_RETRY_DELAY))
        .unwrap_or(MAX_RETRY_DELAY)
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next pending task on `queue` and leases it.
    async fn dequeue(&self, queue: &str, wait: Duration)
        -> Result<Option<LeasedTask>, QueueError>;

    /// Pushes the lease deadline of a task that is still running.
    async fn extend_lease(&self, leased: &LeasedTask) -> Result<(), QueueError>;

    /// Drops a finished task.
    async fn complete(&self, leased: &LeasedTask) -> Result<(), QueueError>;

    /// Parks `task` (the updated copy of the leased one) until `delay` has
    /// elapsed.
    async fn schedule_retry(
        &self,
        leased: &LeasedTask,
        task: &Task,
        delay: Duration,
    ) -> Result<(), QueueError>;

    async fn archive(&self, leased: &LeasedTask, task: &Task) -> Result<(), QueueError>;

    /// Moves every due scheduled task back to pending. Returns how many moved.
    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError>;

    /// Requeues processing entries whose lease ran out. Returns how many moved.
    async fn recover_expired(&self, queue: &str) -> Result<usize, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

fn pending_key(queue: &str) -> String {
    format!("{}:{}:pending", KEY_PREFIX, queue)
}

fn processing_key(queue: &str) -> String {
    format!("{}:{}:processing", KEY_PREFIX, queue)
}

fn leases_key(queue: &str) -> String {
    format!("{}:{}:leases", KEY_PREFIX, queue)
}

fn scheduled_key(queue: &str) -> String {
    format!("{}:{}:scheduled", KEY_PREFIX, queue)
}

fn archived_key(queue: &str) -> String {
    format!("{}:{}:archived", KEY_PREFIX, queue)
}

fn deadline_ms(after: Duration) -> i64 {
    Utc::now().timestamp_millis() + after.as_millis() as i64
}

#[derive(Clone)]
pub struct RedisTaskQueue {
    client: redis::Client,
    lease: Duration,
    // Idle connections. BLMOVE parks whichever connection runs it, so each
    // concurrent caller needs its own; the pool settles at the peak
    // concurrency and reuses from there.
    idle: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl RedisTaskQueue {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            lease: DEFAULT_LEASE,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_url(url: &str) -> Result<Self, QueueError> {
        Ok(Self::new(redis::Client::open(url)?))
    }

    /// How long a dequeued task may go without a heartbeat before it is
    /// handed to another worker.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn checkout(&self) -> Result<MultiplexedConnection, QueueError> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match reused {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    /// Returns a connection that finished its command cleanly. Connections
    /// that saw an error are dropped instead.
    fn checkin(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        T: Send,
        F: for<'c> FnOnce(
                &'c mut MultiplexedConnection,
            ) -> futures_util::future::BoxFuture<'c, redis::RedisResult<T>>
            + Send,
    {
        let mut conn = self.checkout().await?;
        let result = op(&mut conn).await?;
        self.checkin(conn);
        Ok(result)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let key = pending_key(&task.queue);
        self.run(|conn| {
            Box::pin(async move {
                redis::cmd("LPUSH")
                    .arg(key)
                    .arg(payload)
                    .query_async::<_, i64>(conn)
                    .await
            })
        })
        .await?;

        tracing::debug!(task_id = %task.id, kind = %task.kind, queue = %task.queue, "Task enqueued");
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<LeasedTask>, QueueError> {
        let pending = pending_key(queue);
        let processing = processing_key(queue);
        let leases = leases_key(queue);
        let timeout = wait.as_secs_f64().max(0.1);
        let lease = self.lease;

        let moved: Option<String> = self
            .run(|conn| {
                Box::pin(async move {
                    let moved: Option<String> = redis::cmd("BLMOVE")
                        .arg(&pending)
                        .arg(&processing)
                        .arg("RIGHT")
                        .arg("LEFT")
                        .arg(timeout)
                        .query_async(conn)
                        .await?;
                    if let Some(entry) = &moved {
                        redis::cmd("ZADD")
                            .arg(&leases)
                            .arg(deadline_ms(lease))
                            .arg(entry)
                            .query_async::<_, i64>(conn)
                            .await?;
                    }
                    Ok(moved)
                })
            })
            .await?;

        let Some(receipt) = moved else {
            return Ok(None);
        };

        match serde_json::from_str::<Task>(&receipt) {
            Ok(task) => Ok(Some(LeasedTask { task, receipt })),
            Err(e) => {
                // Nothing can run an undecodable entry; keep it for inspection.
                tracing::error!(queue, error = %e, "Archiving undecodable queue entry");
                let archived = archived_key(queue);
                let processing = processing_key(queue);
                let leases = leases_key(queue);
                self.run(|conn| {
                    Box::pin(async move {
                        redis::pipe()
                            .atomic()
                            .cmd("LREM").arg(&processing).arg(1).arg(&receipt).ignore()
                            .cmd("ZREM").arg(&leases).arg(&receipt).ignore()
                            .cmd("LPUSH").arg(&archived).arg(&receipt).ignore()
                            .cmd("LTRIM").arg(&archived).arg(0).arg(ARCHIVE_LIMIT - 1).ignore()
                            .query_async::<_, ()>(conn)
                            .await
                    })
                })
                .await?;
                Err(QueueError::Serialization(e))
            }
        }
    }

    async fn extend_lease(&self, leased: &LeasedTask) -> Result<(), QueueError> {
        let leases = leases_key(&leased.task.queue);
        let receipt = leased.receipt.clone();
        let deadline = deadline_ms(self.lease);
        self.run(|conn| {
            Box::pin(async move {
                // XX: a lease that was already recovered stays gone.
                redis::cmd("ZADD")
                    .arg(&leases)
                    .arg("XX")
                    .arg(deadline)
                    .arg(&receipt)
                    .query_async::<_, i64>(conn)
                    .await
            })
        })
        .await?;
        Ok(())
    }

    async fn complete(&self, leased: &LeasedTask) -> Result<(), QueueError> {
        let processing = processing_key(&leased.task.queue);
        let leases = leases_key(&leased.task.queue);
        let receipt = leased.receipt.clone();
        self.run(|conn| {
            Box::pin(async move {
                redis::pipe()
                    .atomic()
                    .cmd("LREM").arg(&processing).arg(1).arg(&receipt).ignore()
                    .cmd("ZREM").arg(&leases).arg(&receipt).ignore()
                    .query_async::<_, ()>(conn)
                    .await
            })
        })
        .await
    }

    async fn schedule_retry(
        &self,
        leased: &LeasedTask,
        task: &Task,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let processing = processing_key(&leased.task.queue);
        let leases = leases_key(&leased.task.queue);
        let scheduled = scheduled_key(&task.queue);
        let receipt = leased.receipt.clone();
        let due_at = deadline_ms(delay);
        self.run(|conn| {
            Box::pin(async move {
                redis::pipe()
                    .atomic()
                    .cmd("ZADD").arg(&scheduled).arg(due_at).arg(&payload).ignore()
                    .cmd("LREM").arg(&processing).arg(1).arg(&receipt).ignore()
                    .cmd("ZREM").arg(&leases).arg(&receipt).ignore()
                    .query_async::<_, ()>(conn)
                    .await
            })
        })
        .await
    }

    async fn archive(&self, leased: &LeasedTask, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let processing = processing_key(&leased.task.queue);
        let leases = leases_key(&leased.task.queue);
        let archived = archived_key(&task.queue);
        let receipt = leased.receipt.clone();
        self.run(|conn| {
            Box::pin(async move {
                redis::pipe()
                    .atomic()
                    .cmd("LPUSH").arg(&archived).arg(&payload).ignore()
                    .cmd("LTRIM").arg(&archived).arg(0).arg(ARCHIVE_LIMIT - 1).ignore()
                    .cmd("LREM").arg(&processing).arg(1).arg(&receipt).ignore()
                    .cmd("ZREM").arg(&leases).arg(&receipt).ignore()
                    .query_async::<_, ()>(conn)
                    .await
            })
        })
        .await
    }

    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        let scheduled = scheduled_key(queue);
        let pending = pending_key(queue);
        let now = Utc::now().timestamp_millis();
        self.run(|conn| {
            Box::pin(async move {
                redis::Script::new(PROMOTE_SCRIPT)
                    .key(&scheduled)
                    .key(&pending)
                    .arg(now)
                    .arg(PROMOTE_BATCH)
                    .invoke_async::<_, usize>(conn)
                    .await
            })
        })
        .await
    }

    async fn recover_expired(&self, queue: &str) -> Result<usize, QueueError> {
        let processing = processing_key(queue);
        let leases = leases_key(queue);
        let pending = pending_key(queue);
        let now = Utc::now().timestamp_millis();
        let grace = deadline_ms(self.lease);
        self.run(|conn| {
            Box::pin(async move {
                redis::Script::new(RECOVER_SCRIPT)
                    .key(&processing)
                    .key(&leases)
                    .key(&pending)
                    .arg(now)
                    .arg(grace)
                    .invoke_async::<_, usize>(conn)
                    .await
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.run(|conn| {
            Box::pin(async move { redis::cmd("PING").query_async::<_, String>(conn).await })
        })
        .await?;
        Ok(())
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
