//! Persistence seam between the services and the relational store.
//!
//! The store exclusively owns the persisted representation of transactions and
//! webhook attempts. Every status mutation goes through
//! [`TransactionStore::update_status_if_pending`], which is a compare-and-swap
//! guarded by `status = PENDING` at the storage layer.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{TerminalUpdate, Transaction, TransactionStatus, WebhookAttempt};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors worth retrying: the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An open store transaction holding a freshly inserted PENDING row.
///
/// Dropping it without calling [`PendingInitiation::commit`] rolls the row back.
#[async_trait]
pub trait PendingInitiation: Send {
    /// Records the upstream correlation ids on the uncommitted row.
    async fn record_checkout(
        &mut self,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> StoreResult<()>;

    /// Records an upstream rejection on the uncommitted row. Status stays PENDING.
    async fn record_error(&mut self, error_message: &str) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<Transaction>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Opens a store transaction and inserts `tx` as PENDING.
    /// A duplicate idempotency key yields [`StoreError::Conflict`].
    async fn begin_initiation(&self, tx: &Transaction) -> StoreResult<Box<dyn PendingInitiation>>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>>;

    async fn find_by_checkout_id(&self, checkout_request_id: &str)
        -> StoreResult<Option<Transaction>>;

    /// Applies `update` only if the row is still PENDING. Returns the number of
    /// rows changed; zero means another delivery already won.
    async fn update_status_if_pending(&self, id: Uuid, update: &TerminalUpdate) -> StoreResult<u64>;

    /// Appends one audit row. Rows are never updated afterwards.
    async fn record_webhook_attempt(&self, attempt: &WebhookAttempt) -> StoreResult<()>;

    /// Audit trail for a transaction, newest attempt first.
    async fn list_webhook_attempts(&self, transaction_id: Uuid) -> StoreResult<Vec<WebhookAttempt>>;

    async fn ping(&self) -> StoreResult<()>;
}
