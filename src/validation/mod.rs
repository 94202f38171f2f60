use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::services::InitiatePayment;

pub const PHONE_LEN: usize = 12;
pub const PHONE_PREFIX: &str = "254";
pub const AMOUNT_INPUT_MAX_LEN: usize = 32;
/// Matches the `NUMERIC(20, 2)` amount column.
pub const AMOUNT_MAX_SCALE: i64 = 2;
pub const AMOUNT_MAX_INTEGER_DIGITS: u32 = 18;
pub const WEBHOOK_URL_MAX_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult<T = ()> = Result<T, ValidationError>;

/// Body of `POST /initiate` before validation. Every field arrives as a string.
#[derive(Debug, Clone, Deserialize)]
pub struct InitiatePaymentRequest {
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub idempotency_key: String,
}

impl InitiatePaymentRequest {
    pub fn validate(&self) -> ValidationResult<InitiatePayment> {
        Ok(InitiatePayment {
            amount: validate_amount(&self.amount)?,
            phone: validate_phone(&self.phone)?,
            webhook_url: validate_webhook_url(&self.webhook_url)?,
            idempotency_key: validate_idempotency_key(&self.idempotency_key)?,
        })
    }
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

/// A positive decimal such as `"100"` or `"99.50"`. Exponents are rejected so
/// that only plain decimal notation is accepted. The value must fit the
/// stored column exactly: at most two decimal places and eighteen integer
/// digits.
pub fn validate_amount(raw: &str) -> ValidationResult<BigDecimal> {
    let raw = raw.trim();
    validate_required("amount", raw)?;
    validate_max_len("amount", raw, AMOUNT_INPUT_MAX_LEN)?;

    if !raw.chars().all(|ch| ch.is_ascii_digit() || ch == '.' || ch == '-' || ch == '+') {
        return Err(ValidationError::new("amount", "must be a decimal number"));
    }

    let amount = BigDecimal::from_str(raw)
        .map_err(|_| ValidationError::new("amount", "must be a decimal number"))?;

    if amount <= BigDecimal::from(0) {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    // Trailing zeros carry no precision: "99.500" is stored exactly.
    let (_, scale) = amount.normalized().as_bigint_and_exponent();
    if scale > AMOUNT_MAX_SCALE {
        return Err(ValidationError::new(
            "amount",
            format!("must have at most {} decimal places", AMOUNT_MAX_SCALE),
        ));
    }

    if amount >= BigDecimal::from(10u64.pow(AMOUNT_MAX_INTEGER_DIGITS)) {
        return Err(ValidationError::new(
            "amount",
            format!("must have at most {} integer digits", AMOUNT_MAX_INTEGER_DIGITS),
        ));
    }

    Ok(amount)
}

/// Twelve digits starting with the Kenyan country code, e.g. `254712345678`.
pub fn validate_phone(raw: &str) -> ValidationResult<String> {
    let phone = raw.trim();
    validate_required("phone", phone)?;

    if phone.len() != PHONE_LEN || !phone.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ValidationError::new(
            "phone",
            format!("must be exactly {} digits", PHONE_LEN),
        ));
    }

    if !phone.starts_with(PHONE_PREFIX) {
        return Err(ValidationError::new(
            "phone",
            format!("must start with {}", PHONE_PREFIX),
        ));
    }

    Ok(phone.to_string())
}

pub fn validate_webhook_url(raw: &str) -> ValidationResult<String> {
    let raw = raw.trim();
    validate_required("webhook_url", raw)?;
    validate_max_len("webhook_url", raw, WEBHOOK_URL_MAX_LEN)?;

    let url = url::Url::parse(raw)
        .map_err(|e| ValidationError::new("webhook_url", format!("is not a valid URL: {}", e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::new("webhook_url", "must use http or https"));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::new("webhook_url", "must include a host"));
    }

    Ok(raw.to_string())
}

pub fn validate_idempotency_key(raw: &str) -> ValidationResult<Uuid> {
    let raw = raw.trim();
    validate_required("idempotency_key", raw)?;

    let key = Uuid::parse_str(raw)
        .map_err(|_| ValidationError::new("idempotency_key", "must be a UUID"))?;

    if key.is_nil() {
        return Err(ValidationError::new("idempotency_key", "must not be the nil UUID"));
    }

    Ok(key)
}
