use colabri_live::config::Config;
use colabri_live::db::{FsGateway, MemoryGateway, PersistenceGateway};
use colabri_live::room::Registry;
use colabri_live::routes::build_router;
use colabri_live::AppState;
use std::panic;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Load configuration before tracing so LOG_LEVEL can steer the filter
    let loaded = Config::load();
    let log_filter = loaded
        .as_ref()
        .map(Config::log_filter)
        .unwrap_or_else(|_| Config::default().log_filter());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .init();

    info!("Starting server...");

    let config = loaded.unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    if config.is_development() {
        warn!("Running in {} mode", config.environment);
    }

    // Pick the snapshot store
    let gateway: Arc<dyn PersistenceGateway> = match &config.data_dir {
        Some(dir) => {
            info!("Persisting room snapshots under {}", dir);
            Arc::new(FsGateway::new(dir))
        }
        None => {
            warn!("No DATA_DIR configured - room snapshots are kept in memory only");
            Arc::new(MemoryGateway::new())
        }
    };

    let registry = Registry::new(gateway, config.room_config());
    let address = config.server_address();
    let state = AppState::new(registry.clone(), config);
    let app_routes = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws/{{resource_type}}/{{resource_id}}", address);
    info!("📚 OpenAPI document at http://{}/api-docs/openapi.json", address);

    if let Err(e) = axum::serve(listener, app_routes)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Flushing {} live rooms before exit", registry.room_count());
    registry.flush_all().await;
    info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
