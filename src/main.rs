use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mpesa_gateway::adapters::PostgresTransactionStore;
use mpesa_gateway::cli::{self, Cli, Commands, DbCommands};
use mpesa_gateway::config::{Config, LogFormat};
use mpesa_gateway::mpesa::{AccessTokenCache, StkPushClient, StkPushConfig};
use mpesa_gateway::ports::TransactionStore;
use mpesa_gateway::queue::{RedisTaskQueue, TaskQueue, WorkerPool, DEFAULT_QUEUE};
use mpesa_gateway::services::{CallbackProcessor, PaymentService, RetrySchedule, WebhookDispatcher};
use mpesa_gateway::{create_app, db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    init_tracing(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            config.validate()?;
            serve(config).await
        }
        Commands::Worker => {
            config.validate()?;
            run_worker(config).await
        }
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
        Commands::Check => cli::handle_check(&config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn TransactionStore>> {
    let pool = db::create_pool(config)
        .await
        .context("failed to connect to the database")?;
    tracing::info!(
        database = %mpesa_gateway::config::mask_connection_string(&config.database_url),
        "Database pool ready"
    );
    Ok(Arc::new(PostgresTransactionStore::new(pool)))
}

fn connect_queue(config: &Config) -> anyhow::Result<Arc<dyn TaskQueue>> {
    let queue = RedisTaskQueue::from_url(&config.redis_url).context("invalid redis URL")?;
    Ok(Arc::new(queue))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let queue = connect_queue(&config)?;

    let tokens = Arc::new(AccessTokenCache::new(
        config.auth_url.clone(),
        config.consumer_key.clone(),
        config.consumer_secret.clone(),
    )?);
    let stk = StkPushClient::new(
        StkPushConfig {
            short_code: config.short_code.clone(),
            passkey: config.passkey.clone(),
            stk_push_url: config.stk_push_url.clone(),
            callback_url: config.callback_url.clone(),
        },
        tokens,
    )?;

    let state = AppState {
        store: Arc::clone(&store),
        payments: PaymentService::new(store, stk),
        queue,
        internal_secret: Arc::from(config.internal_secret.as_str()),
        allowed_ips: config.allowed_ips.clone(),
        max_request_size: config.max_request_size,
    };

    let app = create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let queue = connect_queue(&config)?;

    let webhooks = WebhookDispatcher::new(
        Arc::clone(&store),
        RetrySchedule::new(config.webhook_backoff.clone()),
    )?;
    let processor = CallbackProcessor::new(store, webhooks);

    let pool = WorkerPool::new(queue, DEFAULT_QUEUE, config.worker_concurrency)
        .register(Arc::new(processor));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tokio::spawn(pool.run(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("Shutdown requested, draining in-flight tasks");
    shutdown_tx.send(true).ok();

    workers.await.context("worker pool panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
