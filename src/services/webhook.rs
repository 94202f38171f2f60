//! Outbound delivery of terminal transaction outcomes to tenant webhooks.
//!
//! Every attempt, successful or not, is appended to the store as a
//! [`WebhookAttempt`] before the next one is considered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bigdecimal::BigDecimal;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Metadata, Transaction, TransactionStatus, WebhookAttempt};
use crate::ports::TransactionStore;

type HmacSha256 = Hmac<Sha256>;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_STORED_RESPONSE_BODY: usize = 4096;
pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const MAX_ATTEMPTS: usize = 4;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("failed to encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("webhook delivery to {url} failed after {attempts} attempts")]
    Exhausted { url: String, attempts: usize },
}

/// Delay before each attempt. The first entry applies to attempt 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    /// An empty list still yields a single immediate attempt.
    pub fn new(delays: Vec<Duration>) -> Self {
        let delays = if delays.is_empty() {
            vec![Duration::ZERO]
        } else {
            delays
        };
        Self { delays }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn delay_before(&self, attempt_number: usize) -> Duration {
        attempt_number
            .checked_sub(1)
            .and_then(|i| self.delays.get(i))
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetrySchedule {
    /// Immediately, then 1, 5 and 15 minutes.
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(60),
            Duration::from_secs(5 * 60),
            Duration::from_secs(15 * 60),
        ])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub amount: BigDecimal,
    pub phone: String,
    pub metadata: Metadata,
    pub timestamp: String,
}

impl WebhookPayload {
    pub fn new(tx: &Transaction, status: TransactionStatus, metadata: &Metadata) -> Self {
        Self {
            transaction_id: tx.id,
            status,
            amount: tx.amount.clone(),
            phone: tx.phone.clone(),
            metadata: metadata.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Attempt number that was acknowledged.
    pub attempts: usize,
}

/// Hex HMAC-SHA256 of `body` keyed by `key`.
pub fn sign_payload(body: &[u8], key: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take a key of any size"),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    store: Arc<dyn TransactionStore>,
    schedule: RetrySchedule,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn TransactionStore>, schedule: RetrySchedule) -> Result<Self, reqwest::Error> {
        let client = crate::utils::secure_client(WEBHOOK_TIMEOUT)?;
        Ok(Self {
            client,
            store,
            schedule,
        })
    }

    /// Delivers the outcome of `tx`, retrying per the schedule. Sleeps between
    /// attempts on the calling task.
    pub async fn deliver(
        &self,
        tx: &Transaction,
        status: TransactionStatus,
        metadata: &Metadata,
    ) -> Result<DeliveryReceipt, WebhookError> {
        let payload = WebhookPayload::new(tx, status, metadata);
        let body = serde_json::to_vec(&payload)?;
        let payload_value = serde_json::to_value(&payload)?;
        let signature = sign_payload(&body, &tx.id.to_string());

        for attempt_number in 1..=self.schedule.attempts() {
            let delay = self.schedule.delay_before(attempt_number);
            if !delay.is_zero() {
                tracing::debug!(
                    transaction_id = %tx.id,
                    attempt = attempt_number,
                    delay_secs = delay.as_secs(),
                    "Waiting before webhook retry"
                );
                tokio::time::sleep(delay).await;
            }

            let attempted_at = Utc::now();
            let started = Instant::now();
            let outcome = self.send(&tx.webhook_url, &body, &signature).await;
            let response_time_ms = started.elapsed().as_millis() as i64;

            let attempt = WebhookAttempt {
                id: Uuid::new_v4(),
                transaction_id: tx.id,
                attempt_number: attempt_number as i32,
                webhook_url: tx.webhook_url.clone(),
                request_payload: payload_value.clone(),
                response_status_code: outcome.status_code.map(i32::from),
                response_body: outcome.body,
                response_time_ms,
                success: outcome.error.is_none(),
                error_message: outcome.error.clone(),
                attempted_at,
            };

            if let Err(e) = self.store.record_webhook_attempt(&attempt).await {
                tracing::error!(
                    transaction_id = %tx.id,
                    attempt = attempt_number,
                    error = %e,
                    "Failed to persist webhook attempt"
                );
            }

            match outcome.error {
                None => {
                    tracing::info!(
                        transaction_id = %tx.id,
                        attempt = attempt_number,
                        status = %status,
                        "Webhook delivered"
                    );
                    return Ok(DeliveryReceipt {
                        attempts: attempt_number,
                    });
                }
                Some(error) => {
                    tracing::warn!(
                        transaction_id = %tx.id,
                        attempt = attempt_number,
                        error = %error,
                        "Webhook attempt failed"
                    );
                }
            }
        }

        Err(WebhookError::Exhausted {
            url: tx.webhook_url.clone(),
            attempts: self.schedule.attempts(),
        })
    }

    async fn send(&self, url: &str, body: &[u8], signature: &str) -> SendOutcome {
        let result = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_vec())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return SendOutcome {
                    status_code: None,
                    body: None,
                    error: Some(format!("request failed: {}", e)),
                }
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: String = text.chars().take(MAX_STORED_RESPONSE_BODY).collect();

        SendOutcome {
            status_code: Some(status.as_u16()),
            body: Some(body),
            error: (!status.is_success())
                .then(|| format!("webhook endpoint returned status {}", status.as_u16())),
        }
    }
}

struct SendOutcome {
    status_code: Option<u16>,
    body: Option<String>,
    error: Option<String>,
}
