//! Registrar HTTP server library.

pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use registrar_config::AppConfig;
use registrar_domain::{HealthResponse, ReadyResponse};
use registrar_engine::{EngineConfig, EnrollmentEngine};
use registrar_storage::check_connection;
use sqlx::SqlitePool;

use handlers::enrollments::{
    audit_report, cancel_waitlist, drop_enrollment, list_enrollments, submit_enrollment,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub engine: Arc<EnrollmentEngine>,
    pub config: AppConfig,
    pub start_time: Instant,
}

/// Map the app configuration onto the engine's knobs.
pub fn engine_config(config: &AppConfig) -> EngineConfig {
    EngineConfig {
        lock_wait_timeout: config.lock_wait_timeout(),
        lock_hold_ttl: config.lock_hold_ttl(),
        snapshot_interval: config.snapshot_interval,
        max_retries: config.max_retries,
        credit_cap_default: config.credit_cap_default,
        max_waitlist: config.max_waitlist,
        history_window: chrono::Duration::days(config.history_window_days),
        section_cache_ttl: Duration::from_secs(10),
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route(
            "/v1/enrollments",
            post(submit_enrollment).get(list_enrollments),
        )
        .route("/v1/enrollments/drop", post(drop_enrollment))
        .route("/v1/waitlist/cancel", post(cancel_waitlist))
        .route("/v1/audit/report", get(audit_report))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
    })
}

/// Readiness check endpoint.
async fn ready(State(state): State<Arc<AppState>>) -> Json<ReadyResponse> {
    let db_status = match check_connection(&state.pool).await {
        Ok(()) => "connected",
        Err(_) => "disconnected",
    };

    Json(ReadyResponse {
        status: if db_status == "connected" {
            "ok"
        } else {
            "degraded"
        }
        .to_string(),
        database: db_status.to_string(),
    })
}
