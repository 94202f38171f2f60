use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Transaction, WebhookAttempt};
use crate::error::AppError;
use crate::validation::InitiatePaymentRequest;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct TransactionDetails {
    pub transaction: Transaction,
    pub webhook_attempts: Vec<WebhookAttempt>,
}

/// `POST /initiate`
pub async fn initiate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let request: InitiatePaymentRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let request = request.validate()?;

    let initiated = state.payments.initiate_payment(request).await?;

    Ok((StatusCode::CREATED, Json(initiated)))
}

/// `GET /transactions/:id`, with the webhook audit trail newest first.
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let transaction = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", id)))?;

    let webhook_attempts = state.store.list_webhook_attempts(id).await?;

    Ok(Json(TransactionDetails {
        transaction,
        webhook_attempts,
    }))
}
