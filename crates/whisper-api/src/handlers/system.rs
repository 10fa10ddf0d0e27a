use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use utoipa::OpenApi;

use crate::{ApiDoc, AppState};

#[utoipa::path(get, path = "/health", tag = "System",
    responses((status = 200, description = "Service health")))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let worker = match &state.extraction_worker {
        None => "not_configured",
        Some(worker) => match worker.health_check().await {
            Ok(true) => "healthy",
            _ => "unreachable",
        },
    };
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "extraction_worker": worker,
    }))
}

pub async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
