//! Extraction pipeline handler: worker call, draft, reconcile, publish.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use whisper_core::defaults::{
    PROGRESS_CLAIMED, PROGRESS_DRAFT_STORED, PROGRESS_EXTRACTED, PROGRESS_RECONCILED,
};
use whisper_core::{
    Document, Error, ExtractionRecord, ExtractionRequest, ExtractionWorker, Job,
    Result,
};
use whisper_db::Database;
use whisper_reconcile::Reconciler;

use crate::handler::{JobContext, JobHandler, JobResult};

/// Map the extraction worker's own 0..=100 onto the claimed..extracted band.
pub fn scale_worker_progress(percent: u8) -> u8 {
    let span = u32::from(PROGRESS_EXTRACTED - PROGRESS_CLAIMED);
    let scaled = u32::from(percent.min(100)) * span / 100;
    PROGRESS_CLAIMED + scaled as u8
}

/// Runs one extraction job end to end.
///
/// Order per job: claim, extract, validate draft, store draft, reconcile the
/// stored draft, publish. Publishing completes the job in the same store
/// operation, so `complete` is never visible before the record.
pub struct ExtractionPipeline {
    db: Database,
    worker: Arc<dyn ExtractionWorker>,
    reconciler: Reconciler,
}

impl ExtractionPipeline {
    pub fn new(db: Database, worker: Arc<dyn ExtractionWorker>, reconciler: Reconciler) -> Self {
        Self {
            db,
            worker,
            reconciler,
        }
    }

    async fn load_document(&self, ctx: &JobContext) -> Result<(Document, Vec<u8>)> {
        let document = self
            .db
            .documents
            .get(ctx.document_id())
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", ctx.document_id())))?;
        let data = self
            .db
            .blobs
            .get(&document.content_hash)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("stored bytes for document {}", document.id))
            })?;
        Ok((document, data))
    }

    async fn run(&self, ctx: &JobContext) -> Result<Option<ExtractionRecord>> {
        let job_id = ctx.job_id();
        if !ctx.report_progress(PROGRESS_CLAIMED, Some("claimed")).await {
            return Ok(None);
        }
        let (document, data) = self.load_document(ctx).await?;
        let page_count = document.page_count;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u8>();
        let request = ExtractionRequest {
            job_id,
            document,
            data: Arc::new(data),
            progress: Arc::new(move |p| {
                let _ = progress_tx.send(p);
            }),
        };

        let extract_start = Instant::now();
        let extraction = self.worker.extract(request);
        tokio::pin!(extraction);
        let draft = loop {
            tokio::select! {
                result = &mut extraction => break result?,
                Some(percent) = progress_rx.recv() => {
                    if !ctx.report_progress(scale_worker_progress(percent), None).await {
                        // Timed out underneath us; the worker is cancelled by housekeeping.
                        return Ok(None);
                    }
                }
            }
        };
        debug!(
            job_id = %job_id,
            worker = self.worker.name(),
            duration_ms = extract_start.elapsed().as_millis() as u64,
            "Extraction worker returned draft"
        );

        draft.validate(page_count)?;
        self.db.records.put_draft(job_id, &draft).await?;
        if !ctx.report_progress(PROGRESS_DRAFT_STORED, Some("draft stored")).await {
            return Ok(None);
        }

        // Reconcile what was durably stored, not the in-memory copy.
        let stored = self
            .db
            .records
            .get_draft(job_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("draft for job {} vanished", job_id)))?;
        let reconciler = self.reconciler.clone();
        let document_id = ctx.document_id();
        let record = tokio::task::spawn_blocking(move || {
            reconciler.reconcile(document_id, job_id, &stored)
        })
        .await
        .map_err(|e| Error::Reconciliation(format!("reconciliation task failed: {}", e)))??;

        if !ctx.report_progress(PROGRESS_RECONCILED, Some("reconciled")).await {
            return Ok(None);
        }
        self.db.records.put(&record).await?;
        Ok(Some(record))
    }
}

#[async_trait]
impl JobHandler for ExtractionPipeline {
    fn name(&self) -> &str {
        "extraction-pipeline"
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match self.run(&ctx).await {
            Ok(Some(record)) => {
                info!(
                    subsystem = "jobs",
                    component = "pipeline",
                    job_id = %record.job_id,
                    document_id = %record.document_id,
                    check_count = record.checks.len(),
                    "Record published"
                );
                JobResult::Published
            }
            Ok(None) => {
                debug!(job_id = %ctx.job_id(), "Job ended elsewhere, abandoning");
                JobResult::Failed("job ended before the pipeline finished".to_string())
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "pipeline",
                    job_id = %ctx.job_id(),
                    error = %e,
                    "Pipeline failed"
                );
                // Only failures the worker itself reported are worth another attempt.
                match e {
                    Error::Worker(_) => JobResult::Retry(e.to_string()),
                    _ => JobResult::Failed(e.to_string()),
                }
            }
        }
    }

    async fn cancel(&self, job: &Job) {
        if let Err(e) = self.worker.cancel(job.id).await {
            debug!(job_id = %job.id, error = %e, "Worker cancel failed");
        }
    }
}
