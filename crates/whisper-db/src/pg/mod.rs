//! PostgreSQL store backend.
//!
//! Per-document write serialization uses transaction-scoped advisory locks
//! keyed by the document id; the "one in-flight job per document" rule is
//! additionally backed by a partial unique index. Queue claims use
//! `FOR UPDATE SKIP LOCKED` so several workers can share one database.

mod documents;
mod jobs;
mod records;

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tokio::sync::Notify;
use uuid::Uuid;

use whisper_core::{Error, Job, JobState, Result};

pub(crate) const JOB_COLUMNS: &str = "id, document_id, state, progress, error_message, attempt, \
     retry_of, retry_job_id, created_at, started_at, finished_at";

/// PostgreSQL implementation of the document, job and extraction stores.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
    /// Notify handle for event-driven worker wake.
    notify: Arc<Notify>,
}

impl PgStore {
    /// Create a new PgStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_notify(pool, Arc::new(Notify::new()))
    }

    /// Create a new PgStore sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// Serialize writers for one document until the transaction ends.
pub(crate) async fn lock_document(conn: &mut PgConnection, document_id: Uuid) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
        .bind(document_id)
        .execute(conn)
        .await
        .map_err(Error::Database)?;
    Ok(())
}

pub(crate) async fn record_transition(
    conn: &mut PgConnection,
    job_id: Uuid,
    state: JobState,
    progress: u8,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO job_transitions (job_id, state, progress, message, at)
         VALUES ($1, $2, $3, $4, NOW())",
    )
    .bind(job_id)
    .bind(state.as_str())
    .bind(progress as i16)
    .bind(message)
    .execute(conn)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

pub(crate) fn parse_job_row(row: &PgRow) -> Result<Job> {
    let state: String = row.get("state");
    let progress: i16 = row.get("progress");
    let attempt: i32 = row.get("attempt");
    Ok(Job {
        id: row.get("id"),
        document_id: row.get("document_id"),
        state: state.parse()?,
        progress: progress.clamp(0, 100) as u8,
        error_message: row.get("error_message"),
        attempt: attempt.max(0) as u32,
        retry_of: row.get("retry_of"),
        retry_job_id: row.get("retry_job_id"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

/// SQLSTATE of a database error, if any.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|e| e.code())
        .map(|c| c.into_owned())
}
