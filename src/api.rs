//! Administrative HTTP surface.
//!
//! Consumed by the operations dashboard: health probe, fleet status, and
//! manual reconcile/sync triggers.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::fleet::FleetManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<FleetManager>,
}

/// Build the admin router.
pub fn admin_routes(manager: Arc<FleetManager>) -> Router {
    let state = AppState { manager };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/reconcile", post(reconcile))
        .route("/sync/all", post(sync_all))
        .route("/sync/{id}", post(sync_account))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mailroom"
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.status().await)
}

async fn reconcile(State(state): State<AppState>) -> impl IntoResponse {
    info!("Reconcile requested via admin API");
    state.manager.reconcile().await;
    Json(serde_json::json!({ "status": "reconciled" }))
}

async fn sync_all(State(state): State<AppState>) -> impl IntoResponse {
    info!("Full sync requested via admin API");
    let reports = state.manager.sync_all().await;
    Json(reports)
}

async fn sync_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid account id" })),
        )
            .into_response();
    };

    info!(account = %id, "Account sync requested via admin API");
    let report = state.manager.sync_account(id).await;
    let code = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (code, Json(serde_json::json!(report))).into_response()
}
