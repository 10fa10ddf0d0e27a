//! Job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use whisper_core::defaults::PROGRESS_CLAIMED;
use whisper_core::{new_v7, Error, Job, JobRepository, JobState, JobTransition, NewJob, Result};

use super::{lock_document, parse_job_row, record_transition, sqlstate, PgStore, JOB_COLUMNS};

impl PgStore {
    async fn insert_queued(
        conn: &mut sqlx::PgConnection,
        req: &NewJob,
    ) -> Result<Job> {
        let job = Job::queued(new_v7(), req.document_id, req.attempt, req.retry_of);
        let result = sqlx::query(
            "INSERT INTO jobs (id, document_id, state, progress, attempt, retry_of, created_at)
             VALUES ($1, $2, 'queued', 0, $3, $4, $5)",
        )
        .bind(job.id)
        .bind(job.document_id)
        .bind(job.attempt as i32)
        .bind(job.retry_of)
        .bind(job.created_at)
        .execute(&mut *conn)
        .await;

        if let Err(e) = result {
            return Err(match sqlstate(&e).as_deref() {
                Some("23505") => Error::Conflict(format!(
                    "document {} already has a job in flight",
                    req.document_id
                )),
                Some("23503") => Error::NotFound(format!("document {}", req.document_id)),
                _ => Error::Database(e),
            });
        }

        record_transition(conn, job.id, JobState::Queued, 0, None).await?;
        Ok(job)
    }
}

#[async_trait]
impl JobRepository for PgStore {
    async fn enqueue(&self, req: NewJob) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        lock_document(&mut tx, req.document_id).await?;

        let active: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT id, state FROM jobs
             WHERE document_id = $1 AND state IN ('queued', 'processing')",
        )
        .bind(req.document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if let Some((id, state)) = active {
            return Err(Error::Conflict(format!(
                "document {} already has job {} in state {}",
                req.document_id, id, state
            )));
        }

        let job = Self::insert_queued(&mut tx, &req).await?;
        tx.commit().await.map_err(Error::Database)?;

        self.notify.notify_one();
        debug!(job_id = %job.id, document_id = %job.document_id, attempt = job.attempt, "Job queued");
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // FOR UPDATE SKIP LOCKED lets concurrent workers claim distinct jobs.
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET state = 'processing', started_at = $1, progress = GREATEST(progress, $2)
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state = 'queued'
                 ORDER BY created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(Utc::now())
        .bind(PROGRESS_CLAIMED as i16)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = parse_job_row(&row)?;
        record_transition(&mut tx, job.id, JobState::Processing, job.progress, None).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(Some(job))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        message: Option<&str>,
    ) -> Result<bool> {
        let progress = progress.min(99) as i16;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let current: Option<(String, i16)> =
            sqlx::query_as("SELECT state, progress FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;
        let Some((state, stored)) = current else {
            return Ok(false);
        };
        let state: JobState = state.parse()?;
        if state.is_terminal() {
            return Ok(false);
        }

        if progress > stored {
            sqlx::query("UPDATE jobs SET progress = $2 WHERE id = $1")
                .bind(job_id)
                .bind(progress)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            if message.is_some() {
                record_transition(&mut tx, job_id, state, progress as u8, message).await?;
            }
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(true)
    }

    async fn fail(&self, job_id: Uuid, message: &str, retry: bool) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let document_id: Option<Uuid> =
            sqlx::query_scalar("SELECT document_id FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;
        let document_id = document_id.ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        lock_document(&mut tx, document_id).await?;

        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS))
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let job = parse_job_row(&row)?;
        if !job.state.can_transition_to(JobState::Error) {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Error,
            });
        }

        sqlx::query(
            "UPDATE jobs SET state = 'error', error_message = $2, finished_at = $3 WHERE id = $1",
        )
        .bind(job_id)
        .bind(message)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        record_transition(&mut tx, job_id, JobState::Error, job.progress, Some(message)).await?;

        let retry_job = if retry {
            let req = NewJob {
                document_id,
                attempt: job.attempt + 1,
                retry_of: Some(job_id),
            };
            let next = Self::insert_queued(&mut tx, &req).await?;
            sqlx::query("UPDATE jobs SET retry_job_id = $2 WHERE id = $1")
                .bind(job_id)
                .bind(next.id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            Some(next)
        } else {
            None
        };

        tx.commit().await.map_err(Error::Database)?;

        if let Some(next) = &retry_job {
            self.notify.notify_one();
            debug!(job_id = %job_id, retry_job_id = %next.id, "Job failed, retry queued");
        }
        Ok(retry_job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(parse_job_row).transpose()
    }

    async fn latest_for_document(&self, document_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE document_id = $1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.as_ref().map(parse_job_row).transpose()
    }

    async fn list_for_document(&self, document_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE document_id = $1 ORDER BY created_at ASC, id ASC",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(parse_job_row).collect()
    }

    async fn history(&self, job_id: Uuid) -> Result<Vec<JobTransition>> {
        let rows = sqlx::query(
            "SELECT state, progress, message, at FROM job_transitions
             WHERE job_id = $1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| -> Result<JobTransition> {
                let state: String = row.get("state");
                let progress: i16 = row.get("progress");
                Ok(JobTransition {
                    state: state.parse()?,
                    progress: progress.clamp(0, 100) as u8,
                    message: row.get("message"),
                    at: row.get("at"),
                })
            })
            .collect()
    }

    async fn overdue(&self, created_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs
             WHERE state IN ('queued', 'processing') AND created_at < $1
             ORDER BY created_at ASC",
            JOB_COLUMNS
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(parse_job_row).collect()
    }
}
