//! Accord - Provisioning Server

use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod health;

use accord_connectors::{register_builtin, ConnectorRegistry, ConnectorService, ServiceSettings};
use accord_db::{apply_schema, create_pool, CredentialCipher, PgConfigStore, PgTaskStore};
use accord_provisioning::{ProvisioningEngine, ProvisioningWorker};
use config::Settings;
use health::HealthState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let settings = Settings::load().context("Failed to load configuration")?;

    info!("Starting Accord v{}", env!("CARGO_PKG_VERSION"));

    info!("Connecting to PostgreSQL...");
    let pool = create_pool(&settings.database.pool_config())
        .await
        .context("Failed to connect to PostgreSQL")?;
    apply_schema(&pool)
        .await
        .context("Failed to apply database schema")?;

    let cipher = CredentialCipher::from_base64(&settings.security.encryption_key)
        .context("Invalid security.encryption_key")?;

    // Connectors
    let registry = Arc::new(ConnectorRegistry::new());
    register_builtin(&registry).await;
    info!(types = ?registry.registered_types().await, "Connector factories registered");

    let connectors = ConnectorService::with_settings(
        Arc::new(PgConfigStore::new(pool.clone(), cipher)),
        registry.clone(),
        ServiceSettings {
            operation_timeout: settings.engine.operation_timeout(),
        },
    );
    let live = connectors
        .load_enabled()
        .await
        .context("Failed to load connector configuration")?;
    info!("{} connectors live", live);

    // Provisioning
    let engine = Arc::new(ProvisioningEngine::new(
        Arc::new(PgTaskStore::new(pool.clone())),
        registry.clone(),
        settings.engine.engine_settings(),
    ));
    let worker = Arc::new(ProvisioningWorker::new(
        engine,
        settings.engine.worker_config(),
    ));
    let worker_task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let app = create_app(HealthState {
        registry: registry.clone(),
        check_timeout: Duration::from_millis(settings.server.health_check_timeout_ms),
    });

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("Invalid server address")?;

    info!("Server listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind server address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping provisioning worker...");
    worker.shutdown();
    if let Err(e) = worker_task.await {
        error!("Provisioning worker panicked: {}", e);
    }

    registry.close_all().await;
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,accord=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn create_app(state: HealthState) -> Router {
    health::router(state).layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
