//! Worker loop + pipeline handler against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use whisper_core::defaults::MAX_UPLOAD_BYTES;
use whisper_core::fixtures::sample_pdf_with_text;
use whisper_core::{
    new_v7, validate_upload, Document, DraftField, DraftRecord, DraftTotals, Job, JobState,
    NewJob, RawValue,
};
use whisper_db::Database;
use whisper_jobs::{
    ExtractionPipeline, JobWorker, Outcome, ScriptedWorker, WorkerConfig, WorkerEvent,
    WorkerHandle,
};
use whisper_reconcile::Reconciler;

async fn seed_document(db: &Database, label: &str) -> Document {
    let pdf = sample_pdf_with_text(2, label);
    let upload = validate_upload(&pdf, MAX_UPLOAD_BYTES).unwrap();
    db.blobs.put(&upload.content_hash, &pdf).await.unwrap();
    let (doc, _) = db
        .documents
        .insert_or_get(Document {
            id: new_v7(),
            content_hash: upload.content_hash,
            page_count: upload.page_count,
            size_bytes: upload.size_bytes,
            filename: Some("om.pdf".into()),
            uploaded_at: Utc::now(),
        })
        .await
        .unwrap();
    doc
}

fn draft(noi_page: u32) -> DraftRecord {
    DraftRecord {
        totals: DraftTotals {
            egi: Some(DraftField::new(RawValue::text("$1,000,000")).on_page(1)),
            opex: Some(DraftField::new(RawValue::text("$400,000")).on_page(1)),
            noi: Some(DraftField::new(RawValue::text("$600,000")).on_page(noi_page)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(20)
        .with_job_timeout(Duration::from_secs(10))
}

fn start(db: &Database, config: WorkerConfig, worker: Arc<ScriptedWorker>) -> WorkerHandle {
    let pipeline = ExtractionPipeline::new(db.clone(), worker, Reconciler::default());
    JobWorker::new(db.clone(), config, pipeline).start()
}

async fn wait_terminal(db: &Database, job_id: uuid::Uuid) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = db.jobs.get(job_id).await.unwrap().unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state")
}

#[tokio::test]
async fn publishes_record_then_completes() {
    let db = Database::in_memory();
    let doc = seed_document(&db, "publish").await;
    let worker = Arc::new(ScriptedWorker::returning(draft(2)));
    let handle = start(&db, config(), worker.clone());
    let mut events = handle.events();

    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    let done = wait_terminal(&db, job.id).await;

    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.progress, 100);
    assert_eq!(worker.calls(), 1);

    let record = db.records.get(doc.id).await.unwrap().unwrap();
    assert_eq!(record.job_id, job.id);
    assert!(!record.checks.is_empty());
    // The draft is only needed until the record is published.
    assert!(db.records.get_draft(job.id).await.unwrap().is_none());

    let history = db.jobs.history(job.id).await.unwrap();
    let progress: Vec<u8> = history.iter().map(|t| t.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(history.first().map(|t| t.state), Some(JobState::Queued));
    assert_eq!(history.last().map(|t| t.state), Some(JobState::Complete));

    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if event == (WorkerEvent::JobCompleted { job_id: job.id, document_id: doc.id }) {
            completed = true;
        }
    }
    assert!(completed);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn worker_failure_is_retried_once() {
    let db = Database::in_memory();
    let doc = seed_document(&db, "retry").await;
    let worker = Arc::new(ScriptedWorker::failing("ocr engine crashed"));
    let handle = start(&db, config().with_max_auto_retries(1), worker.clone());

    let first = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    let first = wait_terminal(&db, first.id).await;
    assert_eq!(first.state, JobState::Error);
    assert!(first.error_message.as_deref().unwrap().contains("ocr engine crashed"));
    let retry_id = first.retry_job_id.expect("retry queued");

    let retry = wait_terminal(&db, retry_id).await;
    assert_eq!(retry.state, JobState::Error);
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.retry_of, Some(first.id));
    assert_eq!(retry.retry_job_id, None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.calls(), 2);
    assert_eq!(db.jobs.list_for_document(doc.id).await.unwrap().len(), 2);
    assert!(db.records.get(doc.id).await.unwrap().is_none());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_can_succeed() {
    let db = Database::in_memory();
    let doc = seed_document(&db, "flaky").await;
    let worker = Arc::new(ScriptedWorker::new(vec![
        Outcome::Fail("transient".into()),
        Outcome::Draft(draft(1)),
    ]));
    let handle = start(&db, config(), worker.clone());

    let first = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    let first = wait_terminal(&db, first.id).await;
    let retry = wait_terminal(&db, first.retry_job_id.unwrap()).await;

    assert_eq!(retry.state, JobState::Complete);
    let record = db.records.get(doc.id).await.unwrap().unwrap();
    assert_eq!(record.job_id, retry.id);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unresponsive_worker_times_out() {
    let db = Database::in_memory();
    let doc = seed_document(&db, "hang").await;
    let worker = Arc::new(ScriptedWorker::hanging());
    let handle = start(
        &db,
        config().with_job_timeout(Duration::from_secs(1)),
        worker.clone(),
    );

    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    let done = wait_terminal(&db, job.id).await;

    assert_eq!(done.state, JobState::Error);
    assert!(done.error_message.as_deref().unwrap().contains("timeout"));
    assert_eq!(done.retry_job_id, None);
    assert_eq!(worker.cancelled(), vec![job.id]);
    assert!(db.records.get(doc.id).await.unwrap().is_none());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_draft_is_rejected_without_retry() {
    let db = Database::in_memory();
    let doc = seed_document(&db, "malformed").await;
    // Document has 2 pages.
    let worker = Arc::new(ScriptedWorker::returning(draft(9)));
    let handle = start(&db, config(), worker.clone());

    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    let done = wait_terminal(&db, job.id).await;

    assert_eq!(done.state, JobState::Error);
    let message = done.error_message.unwrap();
    assert!(message.contains("malformed worker output"), "{message}");
    assert!(message.contains("page 9"), "{message}");
    assert!(db.records.get_draft(job.id).await.unwrap().is_none());

    // Default config allows one automatic retry; malformed output must not use it.
    assert!(done.retry_job_id.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.calls(), 1);
    assert_eq!(db.jobs.list_for_document(doc.id).await.unwrap().len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn documents_run_in_parallel() {
    let db = Database::in_memory();
    let worker = Arc::new(
        ScriptedWorker::returning(draft(1)).with_delay(Duration::from_millis(200)),
    );
    let handle = start(&db, config().with_max_concurrent(4), worker);

    let mut jobs = Vec::new();
    for label in ["a", "b", "c", "d"] {
        let doc = seed_document(&db, label).await;
        jobs.push(db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap());
    }

    let started = std::time::Instant::now();
    for job in &jobs {
        assert_eq!(wait_terminal(&db, job.id).await.state, JobState::Complete);
    }
    // Four 200ms jobs on four slots finish well under the serial 800ms.
    assert!(started.elapsed() < Duration::from_millis(700));
    handle.shutdown().await.unwrap();
}
