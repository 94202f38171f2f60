#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};
use bigdecimal::BigDecimal;
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::json;
use uuid::Uuid;

use mpesa_gateway::domain::{TerminalUpdate, Transaction, TransactionStatus, WebhookAttempt};
use mpesa_gateway::mpesa::{AccessTokenCache, StkPushClient, StkPushConfig};
use mpesa_gateway::ports::{PendingInitiation, StoreError, StoreResult, TransactionStore};
use mpesa_gateway::queue::{LeasedTask, QueueError, Task, TaskQueue};
use mpesa_gateway::services::RetrySchedule;

pub const SHORT_CODE: &str = "174379";
pub const PASSKEY: &str = "passkey";
pub const CONSUMER_KEY: &str = "key";
pub const CONSUMER_SECRET: &str = "secret";
pub const AUTH_PATH: &str = "/oauth/v1/generate";
pub const STK_PATH: &str = "/mpesa/stkpush/v1/processrequest";
pub const PHONE: &str = "254712345678";

// ---------------------------------------------------------------------------
// In-memory transaction store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    transactions: HashMap<Uuid, Transaction>,
    reserved_keys: HashSet<Uuid>,
    attempts: Vec<WebhookAttempt>,
    fail_attempt_writes: bool,
    unhealthy: bool,
}

/// Mirrors the Postgres store: inserts are invisible until committed and the
/// terminal update only matches PENDING rows.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: Transaction) {
        let mut inner = self.inner.lock().unwrap();
        inner.reserved_keys.insert(tx.idempotency_key);
        inner.transactions.insert(tx.id, tx);
    }

    pub fn transaction(&self, id: Uuid) -> Option<Transaction> {
        self.inner.lock().unwrap().transactions.get(&id).cloned()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().transactions.values().cloned().collect()
    }

    /// Attempts for `transaction_id` in attempt order.
    pub fn attempts_for(&self, transaction_id: Uuid) -> Vec<WebhookAttempt> {
        let mut attempts: Vec<WebhookAttempt> = self
            .inner
            .lock()
            .unwrap()
            .attempts
            .iter()
            .filter(|a| a.transaction_id == transaction_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        attempts
    }

    pub fn fail_attempt_writes(&self) {
        self.inner.lock().unwrap().fail_attempt_writes = true;
    }

    pub fn set_unhealthy(&self) {
        self.inner.lock().unwrap().unhealthy = true;
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn begin_initiation(&self, tx: &Transaction) -> StoreResult<Box<dyn PendingInitiation>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reserved_keys.insert(tx.idempotency_key) {
            return Err(StoreError::Conflict(format!(
                "duplicate idempotency key {}",
                tx.idempotency_key
            )));
        }

        Ok(Box::new(MemoryInitiation {
            inner: Arc::clone(&self.inner),
            transaction: tx.clone(),
            committed: false,
        }))
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        Ok(self.transaction(id))
    }

    async fn find_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> StoreResult<Option<Transaction>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .transactions
            .values()
            .find(|tx| tx.checkout_request_id.as_deref() == Some(checkout_request_id))
            .cloned())
    }

    async fn update_status_if_pending(&self, id: Uuid, update: &TerminalUpdate) -> StoreResult<u64> {
        if !TransactionStatus::Pending.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                from: TransactionStatus::Pending,
                to: update.status,
            });
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.transactions.get_mut(&id) {
            Some(tx) if tx.status == TransactionStatus::Pending => {
                tx.status = update.status;
                tx.metadata = Some(update.metadata.clone());
                tx.error_message = update.error_message.clone();
                tx.completed_at = Some(update.completed_at);
                tx.updated_at = update.completed_at;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn record_webhook_attempt(&self, attempt: &WebhookAttempt) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_attempt_writes {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let duplicate = inner.attempts.iter().any(|a| {
            a.transaction_id == attempt.transaction_id && a.attempt_number == attempt.attempt_number
        });
        if duplicate {
            return Err(StoreError::Conflict("duplicate attempt number".to_string()));
        }
        inner.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_webhook_attempts(&self, transaction_id: Uuid) -> StoreResult<Vec<WebhookAttempt>> {
        let mut attempts = self.attempts_for(transaction_id);
        attempts.reverse();
        Ok(attempts)
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.inner.lock().unwrap().unhealthy {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

struct MemoryInitiation {
    inner: Arc<Mutex<StoreInner>>,
    transaction: Transaction,
    committed: bool,
}

#[async_trait]
impl PendingInitiation for MemoryInitiation {
    async fn record_checkout(
        &mut self,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> StoreResult<()> {
        self.transaction.checkout_request_id = Some(checkout_request_id.to_string());
        self.transaction.merchant_request_id = Some(merchant_request_id.to_string());
        Ok(())
    }

    async fn record_error(&mut self, error_message: &str) -> StoreResult<()> {
        self.transaction.error_message = Some(error_message.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<Transaction> {
        let mut this = self;
        let tx = this.transaction.clone();
        this.inner
            .lock()
            .unwrap()
            .transactions
            .insert(tx.id, tx.clone());
        this.committed = true;
        Ok(tx)
    }
}

impl Drop for MemoryInitiation {
    fn drop(&mut self) {
        if !self.committed {
            if let Ok(mut inner) = self.inner.lock() {
                inner.reserved_keys.remove(&self.transaction.idempotency_key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory task queue
// ---------------------------------------------------------------------------

struct Leased {
    receipt: String,
    deadline: Instant,
    task: Task,
}

struct QueueInner {
    pending: VecDeque<Task>,
    processing: Vec<Leased>,
    scheduled: Vec<(Instant, Task)>,
    archived: Vec<Task>,
    lease: Duration,
    unhealthy: bool,
}

impl Default for QueueInner {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            processing: Vec::new(),
            scheduled: Vec::new(),
            archived: Vec::new(),
            lease: Duration::from_secs(60),
            unhealthy: false,
        }
    }
}

impl QueueInner {
    fn settle(&mut self, receipt: &str) {
        self.processing.retain(|entry| entry.receipt != receipt);
    }
}

#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(lease: Duration) -> Self {
        let queue = Self::default();
        queue.inner.lock().unwrap().lease = lease;
        queue
    }

    pub fn pending(&self) -> Vec<Task> {
        self.inner.lock().unwrap().pending.iter().cloned().collect()
    }

    /// Tasks currently leased to a worker.
    pub fn processing(&self) -> Vec<Task> {
        self.inner
            .lock()
            .unwrap()
            .processing
            .iter()
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn scheduled(&self) -> Vec<Task> {
        self.inner
            .lock()
            .unwrap()
            .scheduled
            .iter()
            .map(|(_, task)| task.clone())
            .collect()
    }

    pub fn archived(&self) -> Vec<Task> {
        self.inner.lock().unwrap().archived.clone()
    }

    /// Parks a task as if a worker had rescheduled it.
    pub fn schedule(&self, task: Task, delay: Duration) {
        self.inner
            .lock()
            .unwrap()
            .scheduled
            .push((Instant::now() + delay, task));
    }

    /// Enqueues `task` and leases it straight back, as a worker would.
    pub async fn checkout(&self, task: Task) -> LeasedTask {
        self.enqueue(&task).await.unwrap();
        self.dequeue(&task.queue, Duration::ZERO)
            .await
            .unwrap()
            .expect("task was just enqueued")
    }

    pub fn set_unhealthy(&self) {
        self.inner.lock().unwrap().unhealthy = true;
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        self.inner.lock().unwrap().pending.push_front(task.clone());
        Ok(())
    }

    async fn dequeue(
        &self,
        _queue: &str,
        wait: Duration,
    ) -> Result<Option<LeasedTask>, QueueError> {
        fn lease_next(inner: &mut QueueInner) -> Result<Option<LeasedTask>, QueueError> {
            let Some(task) = inner.pending.pop_back() else {
                return Ok(None);
            };
            let receipt = serde_json::to_string(&task)?;
            inner.processing.push(Leased {
                receipt: receipt.clone(),
                deadline: Instant::now() + inner.lease,
                task: task.clone(),
            });
            Ok(Some(LeasedTask { task, receipt }))
        }

        if let Some(leased) = lease_next(&mut self.inner.lock().unwrap())? {
            return Ok(Some(leased));
        }
        tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        lease_next(&mut self.inner.lock().unwrap())
    }

    async fn extend_lease(&self, leased: &LeasedTask) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + inner.lease;
        if let Some(entry) = inner
            .processing
            .iter_mut()
            .find(|entry| entry.receipt == leased.receipt)
        {
            entry.deadline = deadline;
        }
        Ok(())
    }

    async fn complete(&self, leased: &LeasedTask) -> Result<(), QueueError> {
        self.inner.lock().unwrap().settle(&leased.receipt);
        Ok(())
    }

    async fn schedule_retry(
        &self,
        leased: &LeasedTask,
        task: &Task,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.settle(&leased.receipt);
        inner.scheduled.push((Instant::now() + delay, task.clone()));
        Ok(())
    }

    async fn archive(&self, leased: &LeasedTask, task: &Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.settle(&leased.receipt);
        inner.archived.push(task.clone());
        Ok(())
    }

    async fn promote_due(&self, _queue: &str) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            inner.scheduled.drain(..).partition(|(due_at, _)| *due_at <= now);
        inner.scheduled = waiting;
        let promoted = due.len();
        for (_, task) in due {
            inner.pending.push_front(task);
        }
        Ok(promoted)
    }

    async fn recover_expired(&self, _queue: &str) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let (expired, live): (Vec<_>, Vec<_>) =
            inner.processing.drain(..).partition(|entry| entry.deadline <= now);
        inner.processing = live;
        let recovered = expired.len();
        for entry in expired {
            inner.pending.push_back(entry.task);
        }
        Ok(recovered)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.inner.lock().unwrap().unhealthy {
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tenant webhook endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReceivedWebhook {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received_at: Instant,
}

impl ReceivedWebhook {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[derive(Clone)]
struct TenantState {
    received: Arc<Mutex<Vec<ReceivedWebhook>>>,
    fail_first: usize,
}

/// A local webhook receiver that answers 500 to the first `fail_first`
/// requests and 200 afterwards, recording everything it sees.
pub struct TenantServer {
    pub url: String,
    received: Arc<Mutex<Vec<ReceivedWebhook>>>,
}

impl TenantServer {
    pub async fn start(fail_first: usize) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hook", post(receive_webhook))
            .with_state(TenantState {
                received: Arc::clone(&received),
                fail_first,
            });

        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(async move {
            let _ = server.await;
        });

        Self {
            url: format!("http://{}/hook", addr),
            received,
        }
    }

    pub fn received(&self) -> Vec<ReceivedWebhook> {
        self.received.lock().unwrap().clone()
    }
}

async fn receive_webhook(
    State(state): State<TenantState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let mut received = state.received.lock().unwrap();
    received.push(ReceivedWebhook {
        headers,
        body,
        received_at: Instant::now(),
    });

    if received.len() <= state.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

// ---------------------------------------------------------------------------
// Upstream fixtures
// ---------------------------------------------------------------------------

pub fn stk_client(base_url: &str) -> StkPushClient {
    let tokens = Arc::new(
        AccessTokenCache::new(
            format!("{}{}", base_url, AUTH_PATH),
            CONSUMER_KEY.to_string(),
            CONSUMER_SECRET.to_string(),
        )
        .unwrap(),
    );

    StkPushClient::new(
        StkPushConfig {
            short_code: SHORT_CODE.to_string(),
            passkey: PASSKEY.to_string(),
            stk_push_url: format!("{}{}", base_url, STK_PATH),
            callback_url: "https://gateway.example.com/callback".to_string(),
        },
        tokens,
    )
    .unwrap()
}

pub async fn mock_token(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", AUTH_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"access_token": "test-token", "expires_in": "3599"}).to_string())
        .create_async()
        .await
}

pub async fn mock_stk_accepted(server: &mut ServerGuard, checkout_request_id: &str) -> Mock {
    server
        .mock("POST", STK_PATH)
        .match_header("authorization", "Bearer test-token")
        .match_body(Matcher::PartialJson(json!({
            "BusinessShortCode": SHORT_CODE,
            "TransactionType": "CustomerPayBillOnline",
            "PartyA": PHONE,
            "PartyB": SHORT_CODE,
            "PhoneNumber": PHONE,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing",
                "CustomerMessage": "Success. Request accepted for processing"
            })
            .to_string(),
        )
        .create_async()
        .await
}

pub fn pending_transaction(checkout_request_id: &str, webhook_url: &str) -> Transaction {
    let mut tx = Transaction::new_pending(
        BigDecimal::from_str("100").unwrap(),
        PHONE.to_string(),
        webhook_url.to_string(),
        Uuid::new_v4(),
    );
    tx.checkout_request_id = Some(checkout_request_id.to_string());
    tx.merchant_request_id = Some("29115-34620561-1".to_string());
    tx
}

pub fn success_callback(checkout_request_id: &str) -> Vec<u8> {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 100},
                        {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                        {"Name": "TransactionDate", "Value": 20191219102115u64},
                        {"Name": "PhoneNumber", "Value": 254712345678u64}
                    ]
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

pub fn failed_callback(checkout_request_id: &str, result_code: i64, description: &str) -> Vec<u8> {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": description
            }
        }
    })
    .to_string()
    .into_bytes()
}

/// The production shape (immediate, then growing gaps) in milliseconds.
pub fn fast_schedule() -> RetrySchedule {
    RetrySchedule::new(vec![
        Duration::ZERO,
        Duration::from_millis(40),
        Duration::from_millis(80),
        Duration::from_millis(120),
    ])
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
