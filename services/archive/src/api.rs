use crate::config::ApiConfig;
use crate::error::ArchiveError;
use crate::pool::{ArchiveService, PoolStats};
use crate::record::WriteRequest;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ArchiveService>,
    pub db_pool: PgPool,
}

/// Stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub tenants: Vec<PoolStats>,
}

/// Admission response
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: String,
    pub tenant: String,
    pub room_id: u64,
    pub message_id: i64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    fn from_archive_error(e: &ArchiveError) -> (StatusCode, Json<Self>) {
        let (status, code) = match e {
            ArchiveError::Overloaded { .. } => (StatusCode::SERVICE_UNAVAILABLE, "OVERLOADED"),
            ArchiveError::Closed(_) => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            ArchiveError::UnknownTenant(_) => (StatusCode::NOT_FOUND, "UNKNOWN_TENANT"),
        };

        (
            status,
            Json(Self {
                error: e.to_string(),
                code: code.to_string(),
            }),
        )
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/tenants/:tenant/messages", post(submit_message))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "archive-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Per-tenant counters and mailbox depths
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        tenants: state.service.stats(),
    })
}

/// Admit one message into a tenant's archive
#[instrument(skip(state, request), fields(room_id = request.room_id))]
async fn submit_message(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(request): Json<WriteRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), (StatusCode, Json<ErrorResponse>)> {
    let room_id = request.room_id;
    let message_id = request.message_id;

    state
        .service
        .submit(&tenant, request)
        .await
        .map_err(|e| {
            warn!(error = %e, "Message not admitted");
            ErrorResponse::from_archive_error(&e)
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted".to_string(),
            tenant,
            room_id,
            message_id,
        }),
    ))
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting archive API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("Archive API server stopped");

    Ok(())
}
