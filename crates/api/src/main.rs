//! Registrar server binary.
//!
//! Exit codes: 0 on clean shutdown, 64 on configuration error, 70 on an
//! unrecoverable store error at startup. Runtime failures are returned
//! through the API, never by process exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registrar_api::{AppState, build_router, engine_config};
use registrar_config::AppConfig;
use registrar_engine::{CampusDirectory, EnrollmentEngine, InMemoryDirectory};
use registrar_storage::{create_pool, run_migrations};

const EXIT_CONFIG: i32 = 64;
const EXIT_STORE: i32 = 70;

const BACKGROUND_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting registrar server...");

    // Load configuration
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    tracing::info!("Binding to {}", config.bind_address);

    // Open the event, snapshot, and audit collections
    let pool = match create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Event store unavailable: {e}");
            std::process::exit(EXIT_STORE);
        }
    };
    if let Err(e) = run_migrations(&pool).await {
        tracing::error!("Event store migration failed: {e}");
        std::process::exit(EXIT_STORE);
    }
    tracing::info!("Event store ready");

    // Seed the campus directory
    let directory = match &config.catalog_path {
        Some(path) => {
            let offset = chrono::Duration::days(config.add_drop_offset_days);
            match InMemoryDirectory::from_catalog_file(std::path::Path::new(path), offset) {
                Ok(directory) => {
                    tracing::info!(
                        sections = directory.section_count(),
                        students = directory.student_count(),
                        "Catalog loaded from {path}"
                    );
                    directory
                }
                Err(e) => {
                    tracing::error!("Catalog {path} is unreadable: {e}");
                    std::process::exit(EXIT_CONFIG);
                }
            }
        }
        None => {
            tracing::warn!("No catalog configured; directory starts empty");
            InMemoryDirectory::new()
        }
    };

    // Build the engine and its background reconciler
    let engine = Arc::new(EnrollmentEngine::from_pool(
        pool.clone(),
        Arc::new(directory) as Arc<dyn CampusDirectory>,
        engine_config(&config),
    ));
    let background = engine.clone().spawn_background(BACKGROUND_INTERVAL);

    let state = Arc::new(AppState {
        pool,
        engine,
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = build_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Server listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
