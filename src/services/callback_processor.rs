//! Applies queued STK Push results to their transactions.
//!
//! Safe under at-least-once delivery: a transaction that is already terminal
//! is skipped, and the store update itself only matches PENDING rows, so
//! duplicate deliveries converge on a single state change.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{parse_metadata, TerminalUpdate, TransactionStatus};
use crate::mpesa::CallbackEnvelope;
use crate::ports::{StoreError, TransactionStore};
use crate::queue::{HandlerError, Task, TaskHandler, TYPE_PROCESS_CALLBACK};
use crate::services::webhook::WebhookDispatcher;

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("malformed callback payload: {0}")]
    Malformed(String),
    #[error("no transaction for checkout request id {0}")]
    TransactionNotFound(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallbackError {
    /// A missing transaction may simply not be committed yet, so it is worth
    /// another try. Bad payloads and impossible transitions never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallbackError::TransactionNotFound(_) => true,
            CallbackError::Store(e) => e.is_transient(),
            CallbackError::Malformed(_) | CallbackError::InvalidTransition { .. } => false,
        }
    }
}

impl From<CallbackError> for HandlerError {
    fn from(error: CallbackError) -> Self {
        if error.is_retryable() {
            HandlerError::Retryable(error.to_string())
        } else {
            HandlerError::Fatal(error.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// This delivery moved the transaction to `status`. `delivered` tells
    /// whether the tenant webhook acknowledged it.
    Applied {
        transaction_id: Uuid,
        status: TransactionStatus,
        delivered: bool,
    },
    /// The transaction was already terminal; nothing changed.
    AlreadyProcessed {
        transaction_id: Uuid,
        status: TransactionStatus,
    },
}

#[derive(Clone)]
pub struct CallbackProcessor {
    store: Arc<dyn TransactionStore>,
    webhooks: WebhookDispatcher,
}

impl CallbackProcessor {
    pub fn new(store: Arc<dyn TransactionStore>, webhooks: WebhookDispatcher) -> Self {
        Self { store, webhooks }
    }

    pub async fn process(&self, payload: &[u8]) -> Result<CallbackOutcome, CallbackError> {
        let envelope: CallbackEnvelope = serde_json::from_slice(payload)
            .map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let callback = envelope.body.stk_callback;

        let checkout_request_id = callback.checkout_request_id.trim();
        if checkout_request_id.is_empty() {
            return Err(CallbackError::Malformed(
                "missing CheckoutRequestID".to_string(),
            ));
        }

        let tx = self
            .store
            .find_by_checkout_id(checkout_request_id)
            .await?
            .ok_or_else(|| CallbackError::TransactionNotFound(checkout_request_id.to_string()))?;

        if tx.status.is_terminal() {
            tracing::info!(
                transaction_id = %tx.id,
                status = %tx.status,
                "Callback for already processed transaction"
            );
            return Ok(CallbackOutcome::AlreadyProcessed {
                transaction_id: tx.id,
                status: tx.status,
            });
        }

        let next = TransactionStatus::from_result_code(callback.result_code);
        if !tx.status.can_transition_to(next) {
            return Err(CallbackError::InvalidTransition {
                from: tx.status,
                to: next,
            });
        }

        let update = TerminalUpdate {
            status: next,
            metadata: parse_metadata(callback.metadata_items()),
            error_message: (next == TransactionStatus::Failed)
                .then(|| callback.result_desc.clone()),
            completed_at: Utc::now(),
        };

        let affected = self.store.update_status_if_pending(tx.id, &update).await?;
        if affected == 0 {
            // Lost the race to a concurrent delivery of the same callback.
            tracing::info!(transaction_id = %tx.id, "Callback already applied by another worker");
            return Ok(CallbackOutcome::AlreadyProcessed {
                transaction_id: tx.id,
                status: next,
            });
        }

        tracing::info!(
            transaction_id = %tx.id,
            checkout_request_id = %checkout_request_id,
            status = %next,
            result_code = callback.result_code,
            "Transaction reached terminal state"
        );

        let delivered = match self.webhooks.deliver(&tx, next, &update.metadata).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(transaction_id = %tx.id, error = %e, "Webhook delivery failed");
                false
            }
        };

        Ok(CallbackOutcome::Applied {
            transaction_id: tx.id,
            status: next,
            delivered,
        })
    }
}

#[async_trait]
impl TaskHandler for CallbackProcessor {
    fn kind(&self) -> &'static str {
        TYPE_PROCESS_CALLBACK
    }

    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        match self.process(&task.payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(task_id = %task.id, retried = task.retried, error = %e, "Callback task failed");
                Err(e.into())
            }
        }
    }
}
