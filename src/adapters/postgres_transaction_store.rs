//! Postgres implementation of TransactionStore.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::domain::{Metadata, TerminalUpdate, Transaction, TransactionStatus, WebhookAttempt};
use crate::ports::{PendingInitiation, StoreError, StoreResult, TransactionStore};

const IDEMPOTENCY_KEY_CONSTRAINT: &str = "transactions_idempotency_key_key";

/// Postgres-backed transaction store.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn begin_initiation(&self, tx: &Transaction) -> StoreResult<Box<dyn PendingInitiation>> {
        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions (
                id, idempotency_key, amount, phone, status, webhook_url, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(tx.id)
        .bind(tx.idempotency_key)
        .bind(&tx.amount)
        .bind(&tx.phone)
        .bind(tx.status.as_str())
        .bind(&tx.webhook_url)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_one(&mut *db_tx)
        .await
        .map_err(|e| map_insert_error(e, tx.idempotency_key))?;

        Ok(Box::new(PgInitiation {
            db_tx,
            transaction: row.into_domain()?,
        }))
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn find_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE checkout_request_id = $1",
        )
        .bind(checkout_request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn update_status_if_pending(&self, id: Uuid, update: &TerminalUpdate) -> StoreResult<u64> {
        if !TransactionStatus::Pending.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                from: TransactionStatus::Pending,
                to: update.status,
            });
        }

        let metadata = serde_json::to_value(&update.metadata)?;
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1,
                metadata = $2,
                error_message = $3,
                completed_at = $4,
                updated_at = NOW()
            WHERE id = $5 AND status = 'PENDING'
            "#,
        )
        .bind(update.status.as_str())
        .bind(metadata)
        .bind(&update.error_message)
        .bind(update.completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn record_webhook_attempt(&self, attempt: &WebhookAttempt) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_attempts (
                id, transaction_id, attempt_number, webhook_url, request_payload,
                response_status_code, response_body, response_time_ms, success,
                error_message, attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.transaction_id)
        .bind(attempt.attempt_number)
        .bind(&attempt.webhook_url)
        .bind(&attempt.request_payload)
        .bind(attempt.response_status_code)
        .bind(&attempt.response_body)
        .bind(attempt.response_time_ms)
        .bind(attempt.success)
        .bind(&attempt.error_message)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_webhook_attempts(&self, transaction_id: Uuid) -> StoreResult<Vec<WebhookAttempt>> {
        let rows = sqlx::query_as::<_, WebhookAttemptRow>(
            r#"
            SELECT * FROM webhook_attempts
            WHERE transaction_id = $1
            ORDER BY attempted_at DESC, attempt_number DESC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WebhookAttemptRow::into_domain).collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct PgInitiation {
    db_tx: sqlx::Transaction<'static, Postgres>,
    transaction: Transaction,
}

#[async_trait]
impl PendingInitiation for PgInitiation {
    async fn record_checkout(
        &mut self,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE transactions
            SET checkout_request_id = $1, merchant_request_id = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(checkout_request_id)
        .bind(merchant_request_id)
        .bind(self.transaction.id)
        .execute(&mut *self.db_tx)
        .await?;

        self.transaction.checkout_request_id = Some(checkout_request_id.to_string());
        self.transaction.merchant_request_id = Some(merchant_request_id.to_string());
        Ok(())
    }

    async fn record_error(&mut self, error_message: &str) -> StoreResult<()> {
        sqlx::query("UPDATE transactions SET error_message = $1, updated_at = NOW() WHERE id = $2")
            .bind(error_message)
            .bind(self.transaction.id)
            .execute(&mut *self.db_tx)
            .await?;

        self.transaction.error_message = Some(error_message.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<Transaction> {
        let PgInitiation { db_tx, transaction } = *self;
        db_tx.commit().await?;
        Ok(transaction)
    }
}

fn map_insert_error(err: sqlx::Error, idempotency_key: Uuid) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() && db_err.constraint() == Some(IDEMPOTENCY_KEY_CONSTRAINT) {
            return StoreError::Conflict(format!("duplicate idempotency key {}", idempotency_key));
        }
    }
    StoreError::Database(err)
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    idempotency_key: Uuid,
    checkout_request_id: Option<String>,
    merchant_request_id: Option<String>,
    amount: BigDecimal,
    phone: String,
    status: String,
    metadata: Option<serde_json::Value>,
    webhook_url: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    fn into_domain(self) -> StoreResult<Transaction> {
        let status = self
            .status
            .parse::<TransactionStatus>()
            .map_err(|e| StoreError::Corrupt(format!("transaction {}: {}", self.id, e)))?;
        let metadata = self
            .metadata
            .map(serde_json::from_value::<Metadata>)
            .transpose()?;

        Ok(Transaction {
            id: self.id,
            idempotency_key: self.idempotency_key,
            checkout_request_id: self.checkout_request_id,
            merchant_request_id: self.merchant_request_id,
            amount: self.amount,
            phone: self.phone,
            status,
            metadata,
            webhook_url: self.webhook_url,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookAttemptRow {
    id: Uuid,
    transaction_id: Uuid,
    attempt_number: i32,
    webhook_url: String,
    request_payload: serde_json::Value,
    response_status_code: Option<i32>,
    response_body: Option<String>,
    response_time_ms: i64,
    success: bool,
    error_message: Option<String>,
    attempted_at: DateTime<Utc>,
}

impl WebhookAttemptRow {
    fn into_domain(self) -> WebhookAttempt {
        WebhookAttempt {
            id: self.id,
            transaction_id: self.transaction_id,
            attempt_number: self.attempt_number,
            webhook_url: self.webhook_url,
            request_payload: self.request_payload,
            response_status_code: self.response_status_code,
            response_body: self.response_body,
            response_time_ms: self.response_time_ms,
            success: self.success,
            error_message: self.error_message,
            attempted_at: self.attempted_at,
        }
    }
}
