//! Transaction domain entity.
//! Framework-agnostic representation of an STK Push payment and its lifecycle.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::metadata::Metadata;

/// Lifecycle state of a transaction. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown transaction status: {0}")]
pub struct UnknownStatus(pub String);

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// The state machine is fixed: PENDING may move to COMPLETED or FAILED,
    /// and nothing else is ever allowed, including PENDING -> PENDING.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Pending, TransactionStatus::Completed)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
        )
    }

    /// Maps an upstream result code to the terminal status it implies.
    pub fn from_result_code(result_code: i64) -> Self {
        if result_code == 0 {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Domain entity representing a payment transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub idempotency_key: Uuid,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub amount: BigDecimal,
    pub phone: String,
    pub status: TransactionStatus,
    pub metadata: Option<Metadata>,
    pub webhook_url: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Builds a fresh PENDING transaction with a system-generated id.
    pub fn new_pending(
        amount: BigDecimal,
        phone: String,
        webhook_url: String,
        idempotency_key: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key,
            checkout_request_id: None,
            merchant_request_id: None,
            amount,
            phone,
            status: TransactionStatus::Pending,
            metadata: None,
            webhook_url,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// The single mutation applied when a transaction reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: TransactionStatus,
    pub metadata: Metadata,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}
