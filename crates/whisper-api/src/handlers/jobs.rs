//! Job polling.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use whisper_core::JobStatus;

use crate::services::JobDetail;
use crate::{ApiError, AppState};

/// Poll a job: `{state, progress, error?}`.
///
/// Progress never decreases; `complete` and `error` never change once reached.
#[utoipa::path(get, path = "/jobs/{id}/status", tag = "Jobs",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Current job status"),
        (status = 404, description = "Unknown job"),
    ))]
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatus>, ApiError> {
    Ok(Json(state.status.get_status(id).await?))
}

/// Full job with its status history.
#[utoipa::path(get, path = "/jobs/{id}", tag = "Jobs",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job with history"),
        (status = 404, description = "Unknown job"),
    ))]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetail>, ApiError> {
    Ok(Json(state.status.get_job(id).await?))
}
