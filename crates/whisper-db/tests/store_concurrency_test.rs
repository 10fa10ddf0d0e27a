//! Concurrency properties of the in-memory store: one in-flight job per
//! document under races, and all-or-nothing publication.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use whisper_db::{
    new_v7, Check, CheckStatus, Database, Document, Error, ExtractionRecord, Job, JobState,
    Money, NewJob, Totals,
};

fn document(hash: &str) -> Document {
    Document {
        id: new_v7(),
        content_hash: hash.to_string(),
        page_count: 4,
        size_bytes: 1024,
        filename: None,
        uploaded_at: Utc::now(),
    }
}

fn full_record(job: &Job) -> ExtractionRecord {
    ExtractionRecord {
        document_id: job.document_id,
        job_id: job.id,
        totals: Totals {
            egi: Some(Money::from_dollars(1_000_000)),
            opex: Some(Money::from_dollars(400_000)),
            noi: Some(Money::from_dollars(600_000)),
            ..Default::default()
        },
        derivations: vec![],
        t12_lines: vec![],
        rent_roll: vec![],
        debt_terms: None,
        covenants: vec![],
        assumptions: vec![],
        checks: vec![Check::new("noi-derivation", "NOI = EGI - OpEx", CheckStatus::Pass)],
        confidences: BTreeMap::from([("totals".to_string(), 0.9)]),
        provenance: vec![],
        reconciled_at: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_enqueues_create_exactly_one_job() {
    let db = Database::in_memory();
    let (doc, _) = db.documents.insert_or_get(document("blake3:ab01")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let jobs = db.jobs.clone();
        let doc_id = doc.id;
        handles.push(tokio::spawn(async move {
            jobs.enqueue(NewJob::first_attempt(doc_id)).await
        }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(Error::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(db.jobs.list_for_document(doc.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_partial_publication() {
    let db = Database::in_memory();
    let (doc, _) = db.documents.insert_or_get(document("blake3:ab02")).await.unwrap();
    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    db.jobs.claim_next().await.unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        let stop = stop.clone();
        let job_id = job.id;
        readers.push(tokio::spawn(async move {
            let mut observations = 0u32;
            while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                let status = db.jobs.get(job_id).await.unwrap().unwrap();
                let record = db.records.get(doc.id).await.unwrap();
                match record {
                    Some(record) => {
                        // A visible record is always complete and fully formed.
                        assert!(record.totals.noi.is_some());
                        assert!(!record.checks.is_empty());
                        let after = db.jobs.get(job_id).await.unwrap().unwrap();
                        assert_eq!(after.state, JobState::Complete);
                    }
                    None => {
                        // Announced complete implies the record was already visible.
                        if status.state == JobState::Complete {
                            panic!("job complete before record visible");
                        }
                    }
                }
                observations += 1;
                tokio::task::yield_now().await;
            }
            observations
        }));
    }

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    db.records.put(&full_record(&job)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    stop.store(true, std::sync::atomic::Ordering::SeqCst);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn documents_progress_independently() {
    let db = Database::in_memory();
    let mut jobs = Vec::new();
    for i in 0..8 {
        let (doc, _) = db
            .documents
            .insert_or_get(document(&format!("blake3:cd{:02}", i)))
            .await
            .unwrap();
        jobs.push(db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap());
    }

    let mut claimed = Vec::new();
    while let Some(job) = db.jobs.claim_next().await.unwrap() {
        claimed.push(job.id);
    }
    assert_eq!(claimed, jobs.iter().map(|j| j.id).collect::<Vec<_>>());

    let publishes = jobs.iter().map(|job| {
        let db = db.clone();
        let record = full_record(job);
        tokio::spawn(async move { db.records.put(&record).await })
    });
    for handle in publishes.collect::<Vec<_>>() {
        handle.await.unwrap().unwrap();
    }
    for job in &jobs {
        assert_eq!(
            db.jobs.get(job.id).await.unwrap().unwrap().state,
            JobState::Complete
        );
    }
}

#[tokio::test]
async fn terminal_status_is_stable() {
    let db = Database::in_memory();
    let (doc, _) = db.documents.insert_or_get(document("blake3:ab03")).await.unwrap();
    let job = db.jobs.enqueue(NewJob::first_attempt(doc.id)).await.unwrap();
    db.jobs.claim_next().await.unwrap();
    db.jobs.fail(job.id, "worker timeout after 300s", false).await.unwrap();

    let first = db.jobs.get(job.id).await.unwrap().unwrap().status();
    for _ in 0..5 {
        db.jobs.update_progress(job.id, 99, None).await.unwrap();
        let _ = db.records.put(&full_record(&job)).await;
        assert_eq!(db.jobs.get(job.id).await.unwrap().unwrap().status(), first);
    }
}
