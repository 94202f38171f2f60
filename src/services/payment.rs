use std::sync::Arc;

use bigdecimal::BigDecimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Transaction, TransactionStatus};
use crate::mpesa::StkPushClient;
use crate::ports::{StoreError, TransactionStore};

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("duplicate request for idempotency key {0}")]
    DuplicateRequest(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A validated initiation request.
#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub amount: BigDecimal,
    pub phone: String,
    pub webhook_url: String,
    pub idempotency_key: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiatedPayment {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn TransactionStore>,
    stk: StkPushClient,
}

impl PaymentService {
    pub fn new(store: Arc<dyn TransactionStore>, stk: StkPushClient) -> Self {
        Self { store, stk }
    }

    /// Creates a PENDING transaction and fires one STK Push for it.
    ///
    /// The row and the upstream outcome are committed together. An upstream
    /// rejection is stored on the row and the caller still gets PENDING back;
    /// the final status only ever arrives through the callback pipeline.
    pub async fn initiate_payment(
        &self,
        request: InitiatePayment,
    ) -> Result<InitiatedPayment, PaymentError> {
        let tx = Transaction::new_pending(
            request.amount,
            request.phone,
            request.webhook_url,
            request.idempotency_key,
        );

        let mut pending = match self.store.begin_initiation(&tx).await {
            Ok(pending) => pending,
            Err(StoreError::Conflict(_)) => {
                tracing::info!(
                    idempotency_key = %request.idempotency_key,
                    "Rejected duplicate initiation"
                );
                return Err(PaymentError::DuplicateRequest(request.idempotency_key));
            }
            Err(e) => return Err(e.into()),
        };

        let reference = tx.id.to_string();
        match self.stk.push(&tx.phone, &tx.amount, &reference).await {
            Ok(accepted) => {
                pending
                    .record_checkout(&accepted.checkout_request_id, &accepted.merchant_request_id)
                    .await?;
                tracing::info!(
                    transaction_id = %tx.id,
                    checkout_request_id = %accepted.checkout_request_id,
                    "STK Push accepted"
                );
            }
            Err(e) => {
                tracing::warn!(transaction_id = %tx.id, error = %e, "STK Push failed");
                pending.record_error(&e.to_string()).await?;
            }
        }

        let committed = pending.commit().await?;

        Ok(InitiatedPayment {
            transaction_id: committed.id,
            status: committed.status,
        })
    }
}
