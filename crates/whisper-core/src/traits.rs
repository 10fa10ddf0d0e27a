//! Core traits for the pipeline's storage and worker boundaries.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::draft::DraftRecord;
use crate::error::Result;
use crate::models::*;

// =============================================================================
// DOCUMENT REPOSITORY TRAITS
// =============================================================================

/// Repository for uploaded documents, deduplicated by content hash.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert `doc` unless a document with the same content hash exists.
    /// Returns the stored document and whether it was newly created.
    async fn insert_or_get(&self, doc: Document) -> Result<(Document, bool)>;

    /// Fetch a document by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    /// Fetch a document by content hash.
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;
}

// =============================================================================
// JOB REPOSITORY TRAITS
// =============================================================================

/// Request for queueing a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub document_id: Uuid,
    pub attempt: u32,
    pub retry_of: Option<Uuid>,
}

impl NewJob {
    pub fn first_attempt(document_id: Uuid) -> Self {
        Self {
            document_id,
            attempt: 0,
            retry_of: None,
        }
    }
}

/// Repository for the job state machine.
///
/// Implementations enforce "at most one non-terminal job per document" and
/// the legal transitions of [`JobState`] atomically, and append one
/// [`JobTransition`] per state change.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a new job. Fails with `Conflict` when the document already has
    /// a non-terminal job.
    async fn enqueue(&self, req: NewJob) -> Result<Job>;

    /// Claim the oldest queued job: `queued -> processing`.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Raise a job's progress. Stores `max(old, new)`; ignored for terminal
    /// and unknown jobs. Returns whether the job is still non-terminal.
    async fn update_progress(&self, job_id: Uuid, progress: u8, message: Option<&str>)
        -> Result<bool>;

    /// Move a job to `error`. With `retry`, a follow-up job is queued in the
    /// same atomic step and linked through `retry_job_id`; it is returned.
    async fn fail(&self, job_id: Uuid, message: &str, retry: bool) -> Result<Option<Job>>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Most recently created job for a document.
    async fn latest_for_document(&self, document_id: Uuid) -> Result<Option<Job>>;

    /// All jobs for a document, oldest first.
    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<Job>>;

    /// Status history of a job, oldest first.
    async fn history(&self, job_id: Uuid) -> Result<Vec<JobTransition>>;

    /// Non-terminal jobs created before `created_before`.
    async fn overdue(&self, created_before: DateTime<Utc>) -> Result<Vec<Job>>;
}

// =============================================================================
// EXTRACTION STORE TRAITS
// =============================================================================

/// Durable home of drafts and published extraction records.
///
/// Writes are serialized per document. `put` publishes the record and
/// completes the job in one atomic step, so readers see either the previous
/// record or the new one and `complete` is never observable before the
/// record is.
#[async_trait]
pub trait ExtractionStore: Send + Sync {
    /// Durably store the worker's draft for a processing job.
    async fn put_draft(&self, job_id: Uuid, draft: &DraftRecord) -> Result<()>;

    /// Fetch the draft of a job.
    async fn get_draft(&self, job_id: Uuid) -> Result<Option<DraftRecord>>;

    /// Publish a reconciled record and complete its job. Idempotent per
    /// `(document_id, job_id)`: republishing for an already complete job is
    /// a no-op.
    async fn put(&self, record: &ExtractionRecord) -> Result<()>;

    /// Latest published record for a document.
    async fn get(&self, document_id: Uuid) -> Result<Option<ExtractionRecord>>;

    /// Published record of a specific job.
    async fn get_for_job(&self, job_id: Uuid) -> Result<Option<ExtractionRecord>>;
}

// =============================================================================
// EXTRACTION WORKER TRAITS
// =============================================================================

/// Callback receiving the worker's own progress (0..=100).
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Everything a worker needs to extract one document.
#[derive(Clone)]
pub struct ExtractionRequest {
    pub job_id: Uuid,
    pub document: Document,
    pub data: Arc<Vec<u8>>,
    pub progress: ProgressFn,
}

impl std::fmt::Debug for ExtractionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionRequest")
            .field("job_id", &self.job_id)
            .field("document_id", &self.document.id)
            .field("size_bytes", &self.data.len())
            .finish()
    }
}

impl ExtractionRequest {
    pub fn report_progress(&self, percent: u8) {
        (self.progress)(percent.min(100));
    }
}

/// External OCR/NLP collaborator turning document bytes into a draft.
#[async_trait]
pub trait ExtractionWorker: Send + Sync {
    /// Worker name for logs.
    fn name(&self) -> &str;

    /// Extract a draft. Failures are reported as `Error::Worker`.
    async fn extract(&self, req: ExtractionRequest) -> Result<DraftRecord>;

    /// Cancel in-flight work for a job, if the worker supports it.
    async fn cancel(&self, _job_id: Uuid) -> Result<()> {
        Ok(())
    }

    /// Check if the worker is reachable.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct Echo;

    #[async_trait]
    impl ExtractionWorker for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn extract(&self, req: ExtractionRequest) -> Result<DraftRecord> {
            req.report_progress(250);
            Ok(DraftRecord::default())
        }
    }

    #[tokio::test]
    async fn default_cancel_and_health_are_noops() {
        let worker = Echo;
        assert!(worker.cancel(Uuid::nil()).await.is_ok());
        assert!(worker.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn report_progress_clamps_to_100() {
        let seen = Arc::new(AtomicU8::new(0));
        let sink = seen.clone();
        let req = ExtractionRequest {
            job_id: Uuid::nil(),
            document: Document {
                id: Uuid::nil(),
                content_hash: "blake3:00".into(),
                page_count: 1,
                size_bytes: 4,
                filename: None,
                uploaded_at: Utc::now(),
            },
            data: Arc::new(b"%PDF".to_vec()),
            progress: Arc::new(move |p| sink.store(p, Ordering::SeqCst)),
        };
        Echo.extract(req).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }
}
