//! Ingestion gateway: validates uploads, deduplicates by content hash and
//! queues extraction jobs.
//!
//! Resubmission policy for bytes already seen:
//!
//! | Latest job | Result |
//! |------------|--------|
//! | `complete` | that job's handle, `reused: true`, worker not called |
//! | `queued` / `processing` | that job's handle, `reused: true` (coalesced) |
//! | `error` or none | a new job |

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use whisper_core::{
    new_v7, validate_upload, Document, DocumentMetadata, Error, JobHandle, JobState, NewJob,
    Result,
};
use whisper_db::Database;

#[derive(Clone)]
pub struct IngestionGateway {
    db: Database,
    max_upload_bytes: u64,
}

impl IngestionGateway {
    pub fn new(db: Database, max_upload_bytes: u64) -> Self {
        Self {
            db,
            max_upload_bytes,
        }
    }

    /// Accept an upload and return the job that will (or did) extract it.
    ///
    /// Validation failures are returned before anything is stored.
    pub async fn submit(&self, data: &[u8], meta: DocumentMetadata) -> Result<JobHandle> {
        let upload = validate_upload(data, self.max_upload_bytes)?;
        if let Some(declared) = meta.content_type.as_deref() {
            if declared != whisper_core::defaults::PDF_MIME {
                debug!(declared, "Declared content type ignored, bytes are a PDF");
            }
        }

        // Bytes first, so a claimed job can always read them.
        self.db.blobs.put(&upload.content_hash, data).await?;

        let (document, created) = self
            .db
            .documents
            .insert_or_get(Document {
                id: new_v7(),
                content_hash: upload.content_hash,
                page_count: upload.page_count,
                size_bytes: upload.size_bytes,
                filename: meta.filename,
                uploaded_at: Utc::now(),
            })
            .await?;

        if !created {
            if let Some(job) = self.db.jobs.latest_for_document(document.id).await? {
                if job.state != JobState::Error {
                    info!(
                        subsystem = "api",
                        component = "gateway",
                        document_id = %document.id,
                        job_id = %job.id,
                        state = %job.state,
                        "Known document, returning existing job"
                    );
                    return Ok(JobHandle::for_job(&job, true));
                }
            }
        }

        match self.db.jobs.enqueue(NewJob::first_attempt(document.id)).await {
            Ok(job) => {
                info!(
                    subsystem = "api",
                    component = "gateway",
                    document_id = %document.id,
                    job_id = %job.id,
                    page_count = document.page_count,
                    size_bytes = document.size_bytes,
                    new_document = created,
                    "Extraction job queued"
                );
                Ok(JobHandle::for_job(&job, false))
            }
            // A concurrent submission of the same bytes won the race.
            Err(Error::Conflict(_)) => {
                let job = self
                    .db
                    .jobs
                    .latest_for_document(document.id)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal(format!("in-flight job for {} vanished", document.id))
                    })?;
                Ok(JobHandle::for_job(&job, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a new extraction for a stored document.
    ///
    /// `Conflict` while a job for the document is still in flight.
    pub async fn reextract(&self, document_id: Uuid) -> Result<JobHandle> {
        self.db
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;

        let job = self
            .db
            .jobs
            .enqueue(NewJob::first_attempt(document_id))
            .await?;
        info!(
            subsystem = "api",
            component = "gateway",
            document_id = %document_id,
            job_id = %job.id,
            "Re-extraction queued"
        );
        Ok(JobHandle::for_job(&job, false))
    }
}
