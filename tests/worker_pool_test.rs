mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use common::{InMemoryQueue, InMemoryStore, TenantServer};
use mpesa_gateway::domain::TransactionStatus;
use mpesa_gateway::queue::{
    HandlerError, LeasedTask, QueueError, Task, TaskHandler, TaskOutcome, TaskQueue, WorkerPool,
    DEFAULT_QUEUE,
};
use mpesa_gateway::services::{CallbackProcessor, WebhookDispatcher};

const KIND: &str = "test:echo";

/// Replays a fixed result and records every payload it saw.
struct ScriptedHandler {
    result: Result<(), HandlerError>,
    delay: Duration,
    seen: Mutex<Vec<Vec<u8>>>,
    finished: AtomicUsize,
}

impl ScriptedHandler {
    fn new(result: Result<(), HandlerError>) -> Arc<Self> {
        Self::slow(result, Duration::ZERO)
    }

    fn slow(result: Result<(), HandlerError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            result,
            delay,
            seen: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<Vec<u8>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(task.payload.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

fn pool(queue: &InMemoryQueue, handler: Arc<ScriptedHandler>) -> WorkerPool {
    WorkerPool::new(Arc::new(queue.clone()), DEFAULT_QUEUE, 2)
        .register(handler)
        .with_poll_wait(Duration::from_millis(10))
        .with_scheduler_interval(Duration::from_millis(10))
}

fn task(payload: &str, max_retry: u32) -> Task {
    Task::new(KIND, DEFAULT_QUEUE, payload.as_bytes().to_vec(), max_retry)
}

#[tokio::test]
async fn test_successful_task_completes() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Ok(()));

    let leased = queue.checkout(task("a", 3)).await;
    assert_eq!(queue.processing().len(), 1);

    let outcome = pool(&queue, handler.clone()).process(leased).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(handler.seen(), vec![b"a".to_vec()]);
    assert!(queue.processing().is_empty());
    assert!(queue.scheduled().is_empty());
    assert!(queue.archived().is_empty());
}

#[tokio::test]
async fn test_retryable_failure_is_scheduled_with_backoff() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Err(HandlerError::Retryable("not yet".into())));

    let leased = queue.checkout(task("a", 3)).await;
    let outcome = pool(&queue, handler).process(leased).await;

    assert_eq!(
        outcome,
        TaskOutcome::Retrying {
            retried: 1,
            delay: Duration::from_secs(10),
        }
    );
    let scheduled = queue.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].retried, 1);
    assert_eq!(scheduled[0].last_error.as_deref(), Some("not yet"));
    assert!(queue.processing().is_empty());
}

#[tokio::test]
async fn test_retry_budget_exhaustion_archives() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Err(HandlerError::Retryable("still missing".into())));

    let mut spent = task("a", 3);
    spent.retried = 3;
    let leased = queue.checkout(spent).await;
    let outcome = pool(&queue, handler).process(leased).await;

    assert_eq!(
        outcome,
        TaskOutcome::Archived {
            reason: "still missing".into()
        }
    );
    assert!(queue.scheduled().is_empty());
    let archived = queue.archived();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].retried, 3);
}

#[tokio::test]
async fn test_fatal_failure_archives_immediately() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Err(HandlerError::Fatal("bad payload".into())));

    let leased = queue.checkout(task("a", 3)).await;
    let outcome = pool(&queue, handler).process(leased).await;

    assert!(matches!(outcome, TaskOutcome::Archived { .. }));
    assert!(queue.processing().is_empty());
    assert!(queue.scheduled().is_empty());
    assert_eq!(queue.archived()[0].last_error.as_deref(), Some("bad payload"));
}

#[tokio::test]
async fn test_unknown_kind_is_archived() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Ok(()));

    let stray = Task::new("test:unknown", DEFAULT_QUEUE, Vec::new(), 3);
    let leased = queue.checkout(stray).await;
    let outcome = pool(&queue, handler.clone()).process(leased).await;

    assert_eq!(
        outcome,
        TaskOutcome::Archived {
            reason: "no handler registered for test:unknown".into()
        }
    );
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn test_run_consumes_queue_until_shutdown() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Ok(()));
    for payload in ["a", "b", "c", "d", "e"] {
        queue.enqueue(&task(payload, 3)).await.unwrap();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool(&queue, handler.clone()).run(shutdown_rx));

    assert!(common::wait_until(Duration::from_secs(2), || handler.seen().len() == 5).await);
    assert!(queue.pending().is_empty());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("pool stops after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_task() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::slow(Ok(()), Duration::from_millis(200));
    queue.enqueue(&task("slow", 3)).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool(&queue, handler.clone()).run(shutdown_rx));

    assert!(common::wait_until(Duration::from_secs(2), || !handler.seen().is_empty()).await);
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("pool stops after draining")
        .unwrap();
    assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scheduler_promotes_due_retries() {
    let queue = InMemoryQueue::new();
    let handler = ScriptedHandler::new(Ok(()));
    queue.schedule(task("later", 3), Duration::from_millis(30));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool(&queue, handler.clone()).run(shutdown_rx));

    assert!(common::wait_until(Duration::from_secs(2), || handler.seen() == vec![b"later".to_vec()]).await);
    assert!(queue.scheduled().is_empty());

    shutdown_tx.send(true).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_callback_task_runs_through_the_processor() {
    let tenant = TenantServer::start(0).await;
    let store = InMemoryStore::new();
    let tx = common::pending_transaction("ws_CO_queued", &tenant.url);
    store.insert(tx.clone());

    let store_handle: Arc<InMemoryStore> = Arc::new(store.clone());
    let webhooks = WebhookDispatcher::new(store_handle.clone(), common::fast_schedule()).unwrap();
    let processor = CallbackProcessor::new(store_handle, webhooks);

    let queue = InMemoryQueue::new();
    let pool = WorkerPool::new(Arc::new(queue.clone()), DEFAULT_QUEUE, 1).register(Arc::new(processor));

    let leased = queue
        .checkout(Task::callback(common::success_callback("ws_CO_queued")))
        .await;
    let outcome = pool.process(leased).await;
    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(store.transaction(tx.id).unwrap().status, TransactionStatus::Completed);

    // Callback that arrives before its transaction is committed goes back on the queue.
    let leased = queue
        .checkout(Task::callback(common::success_callback("ws_CO_not_yet")))
        .await;
    let early = pool.process(leased).await;
    assert!(matches!(early, TaskOutcome::Retrying { retried: 1, .. }));

    let leased = queue.checkout(Task::callback(b"not json".to_vec())).await;
    let garbage = pool.process(leased).await;
    assert!(matches!(garbage, TaskOutcome::Archived { .. }));
}

#[tokio::test]
async fn test_task_abandoned_by_a_dead_worker_is_redelivered() {
    let queue = InMemoryQueue::with_lease(Duration::from_millis(50));
    let handler = ScriptedHandler::new(Ok(()));

    // A worker leases the task and dies before settling it.
    let abandoned = queue.checkout(task("orphan", 3)).await;
    drop(abandoned);
    assert!(queue.pending().is_empty());
    assert_eq!(queue.processing().len(), 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool(&queue, handler.clone()).run(shutdown_rx));

    assert!(common::wait_until(Duration::from_secs(2), || handler.seen() == vec![b"orphan".to_vec()]).await);
    assert!(common::wait_until(Duration::from_secs(2), || queue.processing().is_empty()).await);

    shutdown_tx.send(true).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_keeps_a_long_task_leased() {
    let queue = InMemoryQueue::with_lease(Duration::from_millis(60));
    let handler = ScriptedHandler::slow(Ok(()), Duration::from_millis(300));
    queue.enqueue(&task("long", 3)).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(
        pool(&queue, handler.clone())
            .with_heartbeat_interval(Duration::from_millis(15))
            .run(shutdown_rx),
    );

    assert!(common::wait_until(Duration::from_secs(2), || handler.finished.load(Ordering::SeqCst) == 1).await);
    shutdown_tx.send(true).unwrap();
    running.await.unwrap();

    // Renewed leases never expired, so the task ran exactly once.
    assert_eq!(handler.seen().len(), 1);
    assert!(queue.pending().is_empty());
    assert!(queue.processing().is_empty());
}

/// Queue whose settle operations fail, as when Redis drops mid-task.
#[derive(Clone)]
struct UnsettleableQueue {
    inner: InMemoryQueue,
}

fn redis_down() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection reset",
    )))
}

#[async_trait]
impl TaskQueue for UnsettleableQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        self.inner.enqueue(task).await
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<LeasedTask>, QueueError> {
        self.inner.dequeue(queue, wait).await
    }

    async fn extend_lease(&self, leased: &LeasedTask) -> Result<(), QueueError> {
        self.inner.extend_lease(leased).await
    }

    async fn complete(&self, _leased: &LeasedTask) -> Result<(), QueueError> {
        Err(redis_down())
    }

    async fn schedule_retry(&self, _: &LeasedTask, _: &Task, _: Duration) -> Result<(), QueueError> {
        Err(redis_down())
    }

    async fn archive(&self, _leased: &LeasedTask, _task: &Task) -> Result<(), QueueError> {
        Err(redis_down())
    }

    async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner.promote_due(queue).await
    }

    async fn recover_expired(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner.recover_expired(queue).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_failed_settlement_leaves_the_task_leased() {
    let memory = InMemoryQueue::with_lease(Duration::from_millis(20));
    let queue = UnsettleableQueue {
        inner: memory.clone(),
    };
    let handler = ScriptedHandler::new(Err(HandlerError::Retryable("upstream down".into())));
    let pool = WorkerPool::new(Arc::new(queue), DEFAULT_QUEUE, 1).register(handler);

    let leased = memory.checkout(task("kept", 3)).await;
    let outcome = pool.process(leased).await;
    assert!(matches!(outcome, TaskOutcome::Retrying { .. }));

    // Neither dropped nor scheduled: still leased, and recovered on expiry.
    assert!(memory.scheduled().is_empty());
    assert_eq!(memory.processing().len(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(memory.recover_expired(DEFAULT_QUEUE).await.unwrap(), 1);
    assert_eq!(memory.pending()[0].payload, b"kept".to_vec());
}
