//! Route table and middleware stack.
//!
//! Layers, outermost first:
//! set request id → propagate request id → trace → catch panic → body limit

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{documents, jobs, system};
use crate::{AppState, MakeRequestUuidV7};

/// Build the HTTP router over shared state.
///
/// Path params use `:param` syntax (axum 0.7).
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.body_limit();

    Router::new()
        .route("/health", get(system::health_check))
        .route("/openapi.json", get(system::openapi_json))
        .route("/documents", post(documents::submit_document))
        .route("/documents/:id", get(documents::get_document))
        .route("/documents/:id/entities", get(documents::get_entities))
        .route(
            "/documents/:id/audit.zip",
            get(documents::download_audit_bundle),
        )
        .route("/documents/:id/proof.pdf", get(documents::download_proof))
        .route(
            "/documents/:id/reextract",
            post(documents::reextract_document),
        )
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/status", get(jobs::get_job_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use whisper_db::Database;

    use crate::ApiConfig;

    fn app() -> Router {
        build_router(AppState::new(Database::in_memory(), ApiConfig::default()))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_missing_worker() {
        let response = app().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["extraction_worker"], "not_configured");
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let response = app().oneshot(get_request("/health")).await.unwrap();
        let id = response
            .headers()
            .get("x-request-id")
            .expect("request id header")
            .to_str()
            .unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn openapi_lists_routes() {
        let response = app().oneshot(get_request("/openapi.json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        for path in ["/documents", "/jobs/{id}/status", "/documents/{id}/audit.zip"] {
            assert!(json["paths"].get(path).is_some(), "missing {path}");
        }
    }

    #[tokio::test]
    async fn malformed_id_is_rejected() {
        let response = app()
            .oneshot(get_request("/jobs/not-a-uuid/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let uri = format!("/jobs/{}/status", uuid::Uuid::now_v7());
        let response = app().oneshot(get_request(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
