use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::config::Config;
use crate::mpesa::AccessTokenCache;
use crate::queue::{RedisTaskQueue, TaskQueue};

pub struct ValidationReport {
    pub environment: bool,
    pub database: bool,
    pub redis: bool,
    pub safaricom: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.database && self.redis && self.safaricom
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Environment Variables: {}", status(self.environment));
        println!("Database Connectivity: {}", status(self.database));
        println!("Redis Connectivity:    {}", status(self.redis));
        println!("Safaricom OAuth:       {}", status(self.safaricom));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  ❌ {}", error);
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("=================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "✅ OK" } else { "❌ FAIL" }
}

/// Checks every external dependency the gateway needs. Never fails itself;
/// problems are collected into the report.
pub async fn validate_environment(config: &Config) -> ValidationReport {
    let mut report = ValidationReport {
        environment: true,
        database: true,
        redis: true,
        safaricom: true,
        errors: Vec::new(),
    };

    if let Err(e) = config.validate() {
        report.environment = false;
        report.errors.push(format!("Environment: {:#}", e));
    }

    if let Err(e) = validate_database(config).await {
        report.database = false;
        report.errors.push(format!("Database: {:#}", e));
    }

    if let Err(e) = validate_redis(&config.redis_url).await {
        report.redis = false;
        report.errors.push(format!("Redis: {:#}", e));
    }

    if let Err(e) = validate_safaricom(config).await {
        report.safaricom = false;
        report.errors.push(format!("Safaricom: {:#}", e));
    }

    report
}

async fn validate_database(config: &Config) -> Result<()> {
    let pool = crate::db::create_pool(config)
        .await
        .context("Failed to connect to database")?;
    check_migrations(&pool).await
}

async fn check_migrations(pool: &PgPool) -> Result<()> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .context("Failed to check migrations table")?;

    if applied == 0 {
        anyhow::bail!("No migrations applied");
    }

    Ok(())
}

async fn validate_redis(redis_url: &str) -> Result<()> {
    let queue = RedisTaskQueue::from_url(redis_url).context("Invalid Redis URL")?;
    queue.ping().await.context("Redis PING failed")?;
    Ok(())
}

/// Fetches one access token, which proves both reachability and credentials.
async fn validate_safaricom(config: &Config) -> Result<()> {
    let tokens = AccessTokenCache::new(
        config.auth_url.clone(),
        config.consumer_key.clone(),
        config.consumer_secret.clone(),
    )?;
    tokens
        .get_token()
        .await
        .context("Failed to obtain an access token")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_is_valid_only_when_every_check_passes() {
        let mut report = ValidationReport {
            environment: true,
            database: true,
            redis: true,
            safaricom: true,
            errors: Vec::new(),
        };
        assert!(report.is_valid());

        report.redis = false;
        assert!(!report.is_valid());
    }
}
