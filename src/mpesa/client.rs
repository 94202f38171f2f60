use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::token::{AccessTokenCache, TokenError};

const STK_PUSH_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";
const TRANSACTION_DESC: &str = "Payment";
/// Safaricom expects timestamps in East Africa Time.
const EAT_OFFSET_SECS: i64 = 3 * 3600;

#[derive(Error, Debug)]
pub enum StkPushError {
    #[error("failed to get access token: {0}")]
    Token(#[from] TokenError),
    #[error("STK Push request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("STK Push failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("STK Push error: {description}")]
    Rejected { code: String, description: String },
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
}

#[derive(Debug, Clone)]
pub struct StkPushConfig {
    pub short_code: String,
    pub passkey: String,
    pub stk_push_url: String,
    pub callback_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushRequest {
    pub business_short_code: String,
    pub password: String,
    pub timestamp: String,
    pub transaction_type: String,
    pub amount: String,
    pub party_a: String,
    pub party_b: String,
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    pub account_reference: String,
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkPushResponse {
    #[serde(default)]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,
    pub response_code: String,
    #[serde(default)]
    pub response_description: String,
    #[serde(default)]
    pub customer_message: String,
}

/// Upstream correlation ids for an accepted STK Push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkPushAccepted {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
}

/// HTTP client for the Safaricom STK Push endpoint.
#[derive(Clone)]
pub struct StkPushClient {
    client: Client,
    config: StkPushConfig,
    tokens: Arc<AccessTokenCache>,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl StkPushClient {
    pub fn new(config: StkPushConfig, tokens: Arc<AccessTokenCache>) -> Result<Self, reqwest::Error> {
        Self::with_circuit_breaker(config, tokens, 5, 30)
    }

    pub fn with_circuit_breaker(
        config: StkPushConfig,
        tokens: Arc<AccessTokenCache>,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = crate::utils::secure_client(STK_PUSH_TIMEOUT)?;

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Ok(StkPushClient {
            client,
            config,
            tokens,
            circuit_breaker,
        })
    }

    /// Sends one STK Push for `amount` to `phone`, tagged with `reference`.
    pub async fn push(
        &self,
        phone: &str,
        amount: &BigDecimal,
        reference: &str,
    ) -> Result<StkPushAccepted, StkPushError> {
        let token = self.tokens.get_token().await?;
        let request = self.build_request(phone, amount, reference, Utc::now());

        let client = self.client.clone();
        let url = self.config.stk_push_url.clone();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client
                    .post(&url)
                    .bearer_auth(token)
                    .json(&request)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(StkPushError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }

                let parsed = response.json::<StkPushResponse>().await?;
                Ok(parsed)
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(FailsafeError::Rejected) => {
                return Err(StkPushError::CircuitBreakerOpen(
                    "STK Push circuit breaker is open".to_string(),
                ))
            }
            Err(FailsafeError::Inner(e)) => return Err(e),
        };

        if response.response_code != "0" {
            return Err(StkPushError::Rejected {
                code: response.response_code,
                description: response.response_description,
            });
        }

        Ok(StkPushAccepted {
            checkout_request_id: response.checkout_request_id,
            merchant_request_id: response.merchant_request_id,
        })
    }

    fn build_request(
        &self,
        phone: &str,
        amount: &BigDecimal,
        reference: &str,
        now: DateTime<Utc>,
    ) -> StkPushRequest {
        let timestamp = format_timestamp(now);
        StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password: stk_password(&self.config.short_code, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: TRANSACTION_TYPE.to_string(),
            amount: whole_amount(amount),
            party_a: phone.to_string(),
            party_b: self.config.short_code.clone(),
            phone_number: phone.to_string(),
            callback_url: self.config.callback_url.clone(),
            account_reference: reference.to_string(),
            transaction_desc: TRANSACTION_DESC.to_string(),
        }
    }
}

/// `base64(short_code ‖ passkey ‖ timestamp)`
pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

/// 14-digit `YYYYMMDDHHMMSS` in East Africa Time.
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::seconds(EAT_OFFSET_SECS))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// The upstream only accepts whole units, so the amount is rounded and
/// rendered without a fractional part.
pub fn whole_amount(amount: &BigDecimal) -> String {
    amount.round(0).with_scale(0).to_string()
}
