use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Immutable audit row for one webhook delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAttempt {
    pub id: Uuid,
    pub transaction_id: Uuid,
    /// 1-based and contiguous per transaction.
    pub attempt_number: i32,
    pub webhook_url: String,
    pub request_payload: serde_json::Value,
    pub response_status_code: Option<i32>,
    pub response_body: Option<String>,
    pub response_time_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}
