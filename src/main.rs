//! FraudGuard Engine
//!
//! An NFT marketplace backend with multi-signal fraud analysis.
//!
//! # Architecture
//!
//! - **Fraud Analyzer**: four-stage pipeline (vision, similarity, metadata, decision)
//! - **Lifecycle Manager**: NFT/Listing state machine with an append-only ledger
//! - **Job Scheduler**: bounded synchronous analysis + retried background tasks
//! - **API Server**: REST endpoints for the marketplace frontend
//!
//! # Graceful Shutdown
//!
//! The engine handles SIGTERM and SIGINT signals, ensuring:
//! - In-flight requests complete
//! - Database connections are closed cleanly

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fraudguard::analyzer::FraudAnalyzer;
use fraudguard::api::{self, AppState};
use fraudguard::config::Config;
use fraudguard::database::{self, Database};
use fraudguard::error::Result;
use fraudguard::marketplace::LifecycleManager;
use fraudguard::providers::ProviderSet;
use fraudguard::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🛡️ FraudGuard Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Components:");
    info!("    • Fraud Analysis Pipeline (vision, similarity, metadata, decision)");
    info!("    • Marketplace Lifecycle Manager");
    info!("    • REST API Server");
    info!("═══════════════════════════════════════════════════════════════");

    // Load configuration; missing required config aborts with non-zero exit
    let config = Config::from_env()?;
    let config = Arc::new(config);
    info!("✅ Configuration loaded and validated");

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize database connection pool
    let db = Database::new(&config.database).await?;
    info!("✅ Database connection pool established");

    // Run migrations
    info!("📦 Running database migrations...");
    database::run_migrations(db.pool()).await?;
    info!("✅ Database migrations applied");

    // Build the provider capability record (constructed once, threaded through)
    let providers = Arc::new(ProviderSet::from_config(
        &config.providers,
        &config.fraud,
        db.pool().clone(),
    ));
    info!("✅ Evidence providers initialized");

    // Analyzer, scheduler, lifecycle manager
    let analyzer = FraudAnalyzer::new(providers.clone(), config.fraud.clone());
    let scheduler = Arc::new(Scheduler::new(
        analyzer,
        providers.clone(),
        db.pool().clone(),
        config.fraud.max_concurrency,
        config.fraud.queue_depth,
        config.api.request_deadline,
    ));
    let lifecycle = LifecycleManager::new(db.pool().clone());

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db: db.clone(),
        lifecycle,
        scheduler,
        providers,
    });

    // Spawn the API server
    info!("🌐 Starting API server on port {}...", config.api.port);
    let mut handles = Vec::new();
    handles.push(spawn_api_server(state, shutdown_tx.clone()));

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}", config.api.host, config.api.port);
    info!(
        "  🔗 Health: http://{}:{}/health",
        config.api.host, config.api.port
    );
    info!("═══════════════════════════════════════════════════════════════");

    // Wait for shutdown signal or service failure
    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_failure(&mut handles) => {
            warn!("⚠️ A service failed, initiating shutdown");
        }
    }

    // Graceful shutdown
    info!("🛑 Initiating graceful shutdown...");

    // Signal all services to stop
    let _ = shutdown_tx.send(());

    // Wait for services to finish with timeout
    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, shutdown_services(handles))
        .await
        .is_err()
    {
        warn!("⚠️ Shutdown timeout exceeded, forcing exit");
    }

    // Cleanup resources
    db.close().await;

    info!("👋 FraudGuard Engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("fraudguard=debug,tower_http=debug,sqlx=warn,info")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();
}

/// Spawn the API server
fn spawn_api_server(
    state: Arc<AppState>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        tokio::select! {
            result = api::start_server(state) => {
                if let Err(e) = result {
                    error!("API server error: {:?}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("API server shutting down");
            }
        }
    })
}

/// Wait for any task to fail
async fn wait_for_any_failure(handles: &mut [tokio::task::JoinHandle<()>]) {
    loop {
        for handle in handles.iter_mut() {
            if handle.is_finished() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait for all services to complete shutdown
async fn shutdown_services(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
