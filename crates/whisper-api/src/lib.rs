//! # whisper-api
//!
//! HTTP surface of the extraction pipeline.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST | `/documents` | multipart PDF upload, returns a job handle |
//! | GET | `/documents/{id}` | document metadata and jobs |
//! | GET | `/documents/{id}/entities` | published ExtractionRecord |
//! | GET | `/documents/{id}/audit.zip` | deterministic audit bundle |
//! | GET | `/documents/{id}/proof.pdf` | annotated source PDF |
//! | POST | `/documents/{id}/reextract` | queue a new extraction |
//! | GET | `/jobs/{id}/status` | `{state, progress, error?}` |
//! | GET | `/jobs/{id}` | job with status history |
//! | GET | `/health`, `/openapi.json` | operations |

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod services;

use std::sync::Arc;

use tower_http::request_id::{MakeRequestId, RequestId};
use utoipa::OpenApi;
use uuid::Uuid;

use whisper_core::ExtractionWorker;
use whisper_db::Database;

pub use config::ApiConfig;
pub use error::ApiError;
pub use router::build_router;
pub use services::{AuditExporter, IngestionGateway, JobStatusService};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<ApiConfig>,
    pub gateway: IngestionGateway,
    pub status: JobStatusService,
    pub exporter: AuditExporter,
    /// Probed by `/health`. Absent when no worker is configured.
    pub extraction_worker: Option<Arc<dyn ExtractionWorker>>,
}

impl AppState {
    pub fn new(db: Database, config: ApiConfig) -> Self {
        Self {
            gateway: IngestionGateway::new(db.clone(), config.max_upload_bytes),
            status: JobStatusService::new(db.clone()),
            exporter: AuditExporter::new(db.clone()),
            config: Arc::new(config),
            extraction_worker: None,
            db,
        }
    }

    pub fn with_extraction_worker(mut self, worker: Arc<dyn ExtractionWorker>) -> Self {
        self.extraction_worker = Some(worker);
        self
    }
}

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Property Whisperer API",
        description = "Document extraction and financial reconciliation for commercial real estate"
    ),
    paths(
        handlers::documents::submit_document,
        handlers::documents::get_document,
        handlers::documents::get_entities,
        handlers::documents::download_audit_bundle,
        handlers::documents::download_proof,
        handlers::documents::reextract_document,
        handlers::jobs::get_job_status,
        handlers::jobs::get_job,
        handlers::system::health_check,
    ),
    components(schemas(handlers::SubmitResponse)),
    tags(
        (name = "Documents", description = "Upload and published records"),
        (name = "Jobs", description = "Extraction job polling"),
        (name = "Exports", description = "Audit bundle and proof PDF"),
        (name = "System", description = "Health"),
    )
)]
pub struct ApiDoc;
