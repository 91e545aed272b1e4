//! L1 transaction manager node
//!
//! Loads configuration, connects to the L1 node and the state database,
//! resumes monitoring of every transaction left in flight by a previous run,
//! and serves the status API and metrics until shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use l1_tx_manager::api;
use l1_tx_manager::chain::{EthersClient, WalletSigner};
use l1_tx_manager::config::Settings;
use l1_tx_manager::metrics::MetricsServer;
use l1_tx_manager::state::PgTxStateStore;
use l1_tx_manager::tx::L1TxManager;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting L1 transaction manager v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} with {} RPC endpoints",
        settings.l1.chain_id,
        settings.l1.rpc_urls.len()
    );

    // Initialize database connection
    let store = Arc::new(
        PgTxStateStore::new(&settings.database)
            .await
            .context("Failed to connect to the state database")?,
    );
    info!("Database connection established");

    store.run_migrations().await?;

    // L1 access
    let client = Arc::new(EthersClient::new(settings.l1.chain_id, &settings.l1.rpc_urls)?);
    info!("L1 client configured for chain {}", client.chain_id());
    if !client.health_check().await {
        warn!("L1 node is not reachable yet, monitors will keep retrying");
    }
    let signer = Arc::new(
        WalletSigner::from_env(&settings.l1.private_key_env, settings.l1.chain_id)
            .context("Failed to load the signing key")?,
    );

    let manager = Arc::new(L1TxManager::new(
        client,
        signer,
        store,
        settings.tx.clone(),
    )?);
    info!("Sending from account {:?}", manager.account());

    // Pick up whatever a previous run left in flight
    let resumed = manager.load_state_and_resume_monitoring().await?;
    if !resumed.is_empty() {
        info!("Resumed monitoring of nonces {:?}", resumed);
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let manager = manager.clone();
        async move {
            if let Err(e) = api::run_server(config, manager).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("L1 transaction manager is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping monitors...");

    // States are checkpointed, the next run resumes them
    manager.interrupt();
    manager.wait_monitoring_stopped().await;

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("L1 transaction manager stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,l1_tx_manager=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
