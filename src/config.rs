use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use dotenvy::dotenv;
use ipnet::IpNet;

pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1 << 20;
pub const DEFAULT_AUTH_URL: &str =
    "https://sandbox.safaricom.co.ke/oauth/v1/generate?grant_type=client_credentials";
pub const DEFAULT_STK_PUSH_URL: &str =
    "https://sandbox.safaricom.co.ke/mpesa/stkpush/v1/processrequest";

/// Source addresses allowed to post callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedIps {
    Any,
    Cidrs(Vec<IpNet>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub redis_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub short_code: String,
    pub auth_url: String,
    pub stk_push_url: String,
    pub callback_url: String,
    pub internal_secret: String,
    pub allowed_ips: AllowedIps,
    pub max_request_size: usize,
    pub worker_concurrency: usize,
    pub webhook_backoff: Vec<Duration>,
    pub log_format: LogFormat,
}

impl Config {
    /// Parses the environment without checking required fields. Call
    /// [`Config::validate`] before serving traffic.
    pub fn load() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Ok(Config {
            server_port: parse_var("MPESA_SERVER_PORT", 8080)?,
            database_url: var_or_empty("MPESA_DATABASE_URL"),
            db_max_connections: parse_var("MPESA_DB_MAX_CONNS", 25)?,
            db_min_connections: parse_var("MPESA_DB_MIN_CONNS", 5)?,
            redis_url: var_or_empty("MPESA_REDIS_URL"),
            consumer_key: var_or_empty("MPESA_SAFARICOM_CONSUMER_KEY"),
            consumer_secret: var_or_empty("MPESA_SAFARICOM_CONSUMER_SECRET"),
            passkey: var_or_empty("MPESA_SAFARICOM_PASSKEY"),
            short_code: var_or_empty("MPESA_SAFARICOM_SHORT_CODE"),
            auth_url: env::var("MPESA_SAFARICOM_AUTH_URL")
                .unwrap_or_else(|_| DEFAULT_AUTH_URL.to_string()),
            stk_push_url: env::var("MPESA_SAFARICOM_STK_PUSH_URL")
                .unwrap_or_else(|_| DEFAULT_STK_PUSH_URL.to_string()),
            callback_url: var_or_empty("MPESA_SAFARICOM_CALLBACK_URL"),
            internal_secret: var_or_empty("MPESA_INTERNAL_SECRET"),
            allowed_ips: parse_allowed_ips(
                &env::var("MPESA_SAFARICOM_IPS").unwrap_or_else(|_| "*".to_string()),
            )?,
            max_request_size: parse_var("MPESA_MAX_REQUEST_SIZE", DEFAULT_MAX_REQUEST_SIZE)?,
            worker_concurrency: parse_var("MPESA_WORKER_CONCURRENCY", 10)?,
            webhook_backoff: parse_backoff(
                &env::var("MPESA_WEBHOOK_BACKOFF_SECS").unwrap_or_else(|_| "0,60,300,900".to_string()),
            )?,
            log_format: match env::var("MPESA_LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }

    /// Missing store or upstream credentials are fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("MPESA_DATABASE_URL", &self.database_url),
            ("MPESA_REDIS_URL", &self.redis_url),
            ("MPESA_INTERNAL_SECRET", &self.internal_secret),
            ("MPESA_SAFARICOM_CONSUMER_KEY", &self.consumer_key),
            ("MPESA_SAFARICOM_CONSUMER_SECRET", &self.consumer_secret),
            ("MPESA_SAFARICOM_PASSKEY", &self.passkey),
            ("MPESA_SAFARICOM_SHORT_CODE", &self.short_code),
            ("MPESA_SAFARICOM_CALLBACK_URL", &self.callback_url),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            anyhow::bail!("missing required configuration: {}", missing.join(", "));
        }

        url::Url::parse(&self.callback_url)
            .context("MPESA_SAFARICOM_CALLBACK_URL is not a valid URL")?;
        url::Url::parse(&self.auth_url).context("MPESA_SAFARICOM_AUTH_URL is not a valid URL")?;
        url::Url::parse(&self.stk_push_url)
            .context("MPESA_SAFARICOM_STK_PUSH_URL is not a valid URL")?;

        if self.worker_concurrency == 0 {
            anyhow::bail!("MPESA_WORKER_CONCURRENCY must be greater than 0");
        }

        Ok(())
    }
}

fn var_or_empty(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value", key)),
        _ => Ok(default),
    }
}

pub fn parse_allowed_ips(raw: &str) -> anyhow::Result<AllowedIps> {
    let value = raw.trim();
    if value.is_empty() || value == "*" {
        return Ok(AllowedIps::Any);
    }

    let cidrs = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_ip_or_cidr)
        .collect::<anyhow::Result<Vec<_>>>()?;

    if cidrs.is_empty() {
        anyhow::bail!("MPESA_SAFARICOM_IPS must be '*' or a comma-separated list of IPs or CIDRs");
    }

    Ok(AllowedIps::Cidrs(cidrs))
}

fn parse_ip_or_cidr(entry: &str) -> anyhow::Result<IpNet> {
    if entry.contains('/') {
        return entry
            .parse::<IpNet>()
            .with_context(|| format!("invalid CIDR '{}'", entry));
    }

    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .with_context(|| format!("invalid IP address '{}'", entry))
}

pub fn parse_backoff(raw: &str) -> anyhow::Result<Vec<Duration>> {
    let delays = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("invalid backoff delay '{}'", entry))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if delays.is_empty() {
        anyhow::bail!("MPESA_WEBHOOK_BACKOFF_SECS must list at least one delay");
    }

    Ok(delays)
}

/// Hides credentials in connection strings before they reach a log line.
pub fn mask_connection_string(url: &str) -> String {
    match url.rsplit_once('@') {
        Some((_, host)) => format!("***@{}", host),
        None => "***".to_string(),
    }
}
