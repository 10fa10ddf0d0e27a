//! PostgreSQL store tests.
//!
//! Opt-in: run with `DATABASE_URL=postgres://... cargo test -- --ignored`.
//! Each test works on its own freshly inserted document.

use std::collections::BTreeMap;

use chrono::Utc;
use whisper_db::{
    new_v7, Database, Document, DraftRecord, Error, ExtractionRecord, JobState, NewJob, Totals,
};

async fn setup_test_db() -> Database {
    dotenvy::dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for PostgreSQL tests");
    let db = Database::connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to run migrations");
    db
}

fn unique_document() -> Document {
    let id = new_v7();
    Document {
        id,
        content_hash: whisper_db::compute_content_hash(id.as_bytes()),
        page_count: 3,
        size_bytes: 2048,
        filename: Some("t12.pdf".into()),
        uploaded_at: Utc::now(),
    }
}

fn empty_record(document_id: uuid::Uuid, job_id: uuid::Uuid) -> ExtractionRecord {
    ExtractionRecord {
        document_id,
        job_id,
        totals: Totals::default(),
        derivations: vec![],
        t12_lines: vec![],
        rent_roll: vec![],
        debt_terms: None,
        covenants: vec![],
        assumptions: vec![],
        checks: vec![],
        confidences: BTreeMap::new(),
        provenance: vec![],
        reconciled_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn pg_document_dedup_by_hash() {
    let db = setup_test_db().await;
    let doc = unique_document();
    let (first, created) = db.documents.insert_or_get(doc.clone()).await.unwrap();
    assert!(created);

    let mut dup = unique_document();
    dup.content_hash = doc.content_hash.clone();
    let (second, created) = db.documents.insert_or_get(dup).await.unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn pg_job_lifecycle_and_history() {
    let db = setup_test_db().await;
    let (doc, _) = db.documents.insert_or_get(unique_document()).await.unwrap();
    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    assert!(matches!(
        db.jobs.enqueue(NewJob::first_attempt(doc.id)).await,
        Err(Error::Conflict(_))
    ));

    // Other tests may share the queue; claim until ours shows up.
    let mut claimed = None;
    while let Some(next) = db.jobs.claim_next().await.unwrap() {
        if next.id == job.id {
            claimed = Some(next);
            break;
        }
    }
    let claimed = claimed.expect("job claimed");
    assert_eq!(claimed.state, JobState::Processing);

    db.jobs.update_progress(job.id, 50, Some("extracting")).await.unwrap();
    db.jobs.update_progress(job.id, 30, None).await.unwrap();
    assert_eq!(db.jobs.get(job.id).await.unwrap().unwrap().progress, 50);

    db.records.put_draft(job.id, &DraftRecord::default()).await.unwrap();
    assert!(db.records.get_draft(job.id).await.unwrap().is_some());

    let record = empty_record(doc.id, job.id);
    db.records.put(&record).await.unwrap();
    db.records.put(&record).await.unwrap();
    assert!(db.records.get_draft(job.id).await.unwrap().is_none());

    let done = db.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.progress, 100);
    assert_eq!(db.records.get(doc.id).await.unwrap().map(|r| r.job_id), Some(job.id));

    let states: Vec<JobState> = db
        .jobs
        .history(job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.state)
        .collect();
    assert_eq!(states.first(), Some(&JobState::Queued));
    assert_eq!(states.last(), Some(&JobState::Complete));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn pg_fail_with_retry_is_atomic() {
    let db = setup_test_db().await;
    let (doc, _) = db.documents.insert_or_get(unique_document()).await.unwrap();
    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();

    let retry = db
        .jobs
        .fail(job.id, "worker crashed", true)
        .await
        .unwrap()
        .expect("retry job");
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.retry_of, Some(job.id));

    let failed = db.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Error);
    assert_eq!(failed.retry_job_id, Some(retry.id));
    assert!(matches!(
        db.jobs.fail(job.id, "again", false).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        db.records.put(&empty_record(doc.id, job.id)).await,
        Err(Error::InvalidTransition { .. })
    ));
}
