//! Document upload, published entities and audit exports.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use whisper_core::{sanitize_filename, DocumentMetadata, ExtractionRecord, JobHandle};

use crate::services::DocumentDetail;
use crate::{ApiError, AppState};

/// Returned by upload and re-extraction.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub document_id: Uuid,
    /// `queued`, `processing`, `complete` or `error`.
    pub state: String,
    /// True when an existing job was returned instead of queuing a new one.
    pub reused: bool,
}

impl From<JobHandle> for SubmitResponse {
    fn from(handle: JobHandle) -> Self {
        Self {
            job_id: handle.job_id,
            document_id: handle.document_id,
            state: handle.state.to_string(),
            reused: handle.reused,
        }
    }
}

/// Upload a PDF for extraction.
///
/// # Multipart Fields
/// - `file`: the PDF (required)
///
/// # Returns
/// - 202 Accepted with a new job
/// - 200 OK with the existing job when the same bytes were already submitted
///   and their job is complete or still running
/// - 400 Bad Request if `file` is missing, empty or not a readable PDF
/// - 413 Payload Too Large above `MAX_UPLOAD_BYTES`
/// - 415 Unsupported Media Type when the bytes are not a PDF
#[utoipa::path(post, path = "/documents", tag = "Documents",
    responses(
        (status = 202, description = "Extraction job queued", body = SubmitResponse),
        (status = 200, description = "Existing job reused", body = SubmitResponse),
        (status = 400, description = "Missing or unreadable file"),
        (status = 413, description = "Upload too large"),
        (status = 415, description = "Not a PDF"),
    ))]
pub async fn submit_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut upload: Option<(Vec<u8>, DocumentMetadata)> = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let meta = DocumentMetadata {
            filename: field.file_name().map(sanitize_filename),
            content_type: field.content_type().map(|c| c.to_string()),
        };
        let data = field.bytes().await?.to_vec();
        upload = Some((data, meta));
    }

    let (data, meta) = upload
        .ok_or_else(|| ApiError::BadRequest("Missing file in multipart form".to_string()))?;

    let handle = state.gateway.submit(&data, meta).await?;
    let status = if handle.reused {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(SubmitResponse::from(handle))))
}

/// Document metadata and every job run against it.
#[utoipa::path(get, path = "/documents/{id}", tag = "Documents",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 200, description = "Document with jobs"),
        (status = 404, description = "Unknown document"),
    ))]
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentDetail>, ApiError> {
    Ok(Json(state.status.get_document(id).await?))
}

/// The published, reconciled record. 404 until a job has completed.
#[utoipa::path(get, path = "/documents/{id}/entities", tag = "Documents",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 200, description = "Extraction record"),
        (status = 404, description = "No completed extraction"),
    ))]
pub async fn get_entities(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExtractionRecord>, ApiError> {
    Ok(Json(state.status.entities(id).await?))
}

/// Deterministic audit bundle (manifest, record, provenance, proof PDF).
#[utoipa::path(get, path = "/documents/{id}/audit.zip", tag = "Exports",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 200, description = "Zip archive"),
        (status = 404, description = "No completed extraction"),
    ))]
pub async fn download_audit_bundle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state.exporter.export(id).await?;
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", bundle.filename),
        ),
    ];
    Ok((headers, bundle.bytes))
}

/// Source PDF annotated with the pages backing each published figure.
#[utoipa::path(get, path = "/documents/{id}/proof.pdf", tag = "Exports",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 200, description = "Annotated PDF"),
        (status = 404, description = "No completed extraction"),
    ))]
pub async fn download_proof(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let pdf = state.exporter.proof_pdf(id).await?;
    let headers = [
        (header::CONTENT_TYPE, whisper_core::defaults::PDF_MIME.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"proof-{}.pdf\"", id),
        ),
    ];
    Ok((headers, pdf))
}

/// Queue a fresh extraction for a stored document.
///
/// 409 while a job for the document is still queued or processing.
#[utoipa::path(post, path = "/documents/{id}/reextract", tag = "Documents",
    params(("id" = Uuid, Path, description = "Document ID")),
    responses(
        (status = 202, description = "Extraction job queued", body = SubmitResponse),
        (status = 404, description = "Unknown document"),
        (status = 409, description = "A job is already in flight"),
    ))]
pub async fn reextract_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.gateway.reextract(id).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse::from(handle))))
}
