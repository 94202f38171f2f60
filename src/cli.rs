use std::path::Path;

use clap::{Parser, Subcommand};

use crate::config::{mask_connection_string, AllowedIps, Config};

pub const MIGRATIONS_DIR: &str = "./migrations";

#[derive(Parser)]
#[command(name = "mpesa-gateway")]
#[command(about = "M-Pesa STK Push gateway", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Consume queued callbacks
    Worker,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Validate and print the configuration
    Config,

    /// Check connectivity to every external dependency
    Check,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool, Path::new(MIGRATIONS_DIR)).await?;
    println!("✓ Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");
    config.validate()?;

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_connection_string(&config.database_url));
    println!("  Redis URL: {}", mask_connection_string(&config.redis_url));
    println!("  Short Code: {}", config.short_code);
    println!("  Auth URL: {}", config.auth_url);
    println!("  STK Push URL: {}", config.stk_push_url);
    println!("  Callback URL: {}", config.callback_url);
    println!("  Callback IPs: {}", describe_allowed_ips(&config.allowed_ips));
    println!("  Max Request Size: {} bytes", config.max_request_size);
    println!("  Worker Concurrency: {}", config.worker_concurrency);
    println!(
        "  Webhook Backoff: {}",
        config
            .webhook_backoff
            .iter()
            .map(|d| format!("{}s", d.as_secs()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    println!("✓ Configuration is valid");
    Ok(())
}

pub async fn handle_check(config: &Config) -> anyhow::Result<()> {
    let report = crate::startup::validate_environment(config).await;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("startup validation failed");
    }
    Ok(())
}

fn describe_allowed_ips(allowed: &AllowedIps) -> String {
    match allowed {
        AllowedIps::Any => "any".to_string(),
        AllowedIps::Cidrs(nets) => nets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}
