//! Job handler abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use whisper_core::{Job, JobRepository};

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(u8, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed, as claimed.
    pub job: Job,
    jobs: Arc<dyn JobRepository>,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job, jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            job,
            jobs,
            progress_callback: None,
        }
    }

    /// Set the progress callback, invoked after each stored update.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u8, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn document_id(&self) -> Uuid {
        self.job.document_id
    }

    /// Record progress on the job.
    ///
    /// Returns `false` once the job is terminal (for example timed out by
    /// housekeeping), which tells the handler to stop early. Store errors are
    /// logged and do not abort the job.
    pub async fn report_progress(&self, percent: u8, message: Option<&str>) -> bool {
        let active = match self.jobs.update_progress(self.job.id, percent, message).await {
            Ok(active) => active,
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "Failed to record job progress");
                true
            }
        };
        if active {
            if let Some(ref callback) = self.progress_callback {
                callback(percent, message);
            }
        }
        active
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The record was published; the store already moved the job to `complete`.
    Published,
    /// Job failed and must not be retried automatically.
    Failed(String),
    /// Job failed in a way an automatic retry may fix.
    Retry(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called when the job ran out of time, after `execute` was dropped.
    async fn cancel(&self, _job: &Job) {}
}
