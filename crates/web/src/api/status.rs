//! Landing page, status and health check endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use ldap_configmap_core::sync_engine::EngineStatus;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health_check))
        .route("/api/status", get(get_status))
}

async fn index() -> Html<&'static str> {
    Html(concat!(
        "<html>\n",
        "<head><title>ldap-configmap</title></head>\n",
        "<body>\n",
        "<h1>ldap-configmap</h1>\n",
        "<p><a href='/metrics'>Metrics</a></p>\n",
        "<p><a href='/api/status'>Status</a></p>\n",
        "</body>\n",
        "</html>\n",
    ))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<EngineStatus> {
    Json(state.sync_engine.status())
}
