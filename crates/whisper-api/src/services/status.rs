//! Job status service. Reads go straight to the authoritative store, so a
//! transition is visible to the very next poll.

use serde::Serialize;
use uuid::Uuid;

use whisper_core::{Document, Error, ExtractionRecord, Job, JobStatus, JobTransition, Result};
use whisper_db::Database;

/// A job with its full status history.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub history: Vec<JobTransition>,
}

/// A document with every job run against it, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentDetail {
    #[serde(flatten)]
    pub document: Document,
    pub jobs: Vec<Job>,
}

#[derive(Clone)]
pub struct JobStatusService {
    db: Database,
}

impl JobStatusService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatus> {
        Ok(self.job(job_id).await?.status())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobDetail> {
        let job = self.job(job_id).await?;
        let history = self.db.jobs.history(job_id).await?;
        Ok(JobDetail { job, history })
    }

    pub async fn get_document(&self, document_id: Uuid) -> Result<DocumentDetail> {
        let document = self
            .db
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;
        let jobs = self.db.jobs.list_for_document(document_id).await?;
        Ok(DocumentDetail { document, jobs })
    }

    /// The published record for a document. `NotFound` until a job for it
    /// has completed.
    pub async fn entities(&self, document_id: Uuid) -> Result<ExtractionRecord> {
        self.db.records.get(document_id).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "no completed extraction for document {}",
                document_id
            ))
        })
    }

    async fn job(&self, job_id: Uuid) -> Result<Job> {
        self.db
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }
}
