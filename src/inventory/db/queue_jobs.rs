use super::InventoryDb;
use crate::inventory::schema::queue_jobs::{self, dsl as queue_dsl};
use crate::tasks::{QueueJob, QueueJobStatus};
use crate::utils::now_secs;
use anyhow::{Context, Result, anyhow};
use diesel::prelude::*;

/// What `enqueue_queue_job` did with the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// A failed or completed entry with the same id was reset
    Reset,
    /// A waiting or active entry already holds the id
    Duplicate,
}

impl InventoryDb {
    /// Insert a queue entry keyed by its id, or reuse the slot of a finished one
    pub fn enqueue_queue_job(&self, job: &QueueJob) -> Result<EnqueueOutcome> {
        let mut conn = self.connection()?;
        let row = QueueJobRow::try_from(job)?;

        conn.immediate_transaction::<_, anyhow::Error, _>(|tx_conn| {
            let existing = queue_dsl::queue_jobs
                .filter(queue_dsl::id.eq(&row.id))
                .select(queue_dsl::status)
                .first::<String>(tx_conn)
                .optional()?;

            match existing.as_deref().and_then(QueueJobStatus::parse) {
                Some(status) if status.is_live() => Ok(EnqueueOutcome::Duplicate),
                Some(_) => {
                    diesel::update(queue_dsl::queue_jobs.filter(queue_dsl::id.eq(&row.id)))
                        .set((
                            queue_dsl::queue.eq(&row.queue),
                            queue_dsl::payload.eq(&row.payload),
                            queue_dsl::status.eq(QueueJobStatus::Waiting.as_str()),
                            queue_dsl::attempts_made.eq(0),
                            queue_dsl::max_attempts.eq(row.max_attempts),
                            queue_dsl::run_at.eq(row.run_at),
                            queue_dsl::last_error.eq(None::<String>),
                            queue_dsl::updated_at.eq(row.updated_at),
                        ))
                        .execute(tx_conn)?;
                    Ok(EnqueueOutcome::Reset)
                }
                None => {
                    diesel::insert_into(queue_jobs::table)
                        .values(&row)
                        .execute(tx_conn)?;
                    Ok(EnqueueOutcome::Inserted)
                }
            }
        })
        .context("Failed to enqueue queue job")
    }

    pub fn get_queue_job(&self, job_id: &str) -> Result<Option<QueueJob>> {
        let mut conn = self.connection()?;
        let row = queue_dsl::queue_jobs
            .filter(queue_dsl::id.eq(job_id))
            .first::<QueueJobRow>(&mut conn)
            .optional()
            .context("Failed to query queue job")?;
        row.map(QueueJob::try_from).transpose()
    }

    /// Move the oldest due waiting entry of a queue to active and count the attempt
    pub fn claim_next_queue_job(&self, queue: &str, now_ms: i64) -> Result<Option<QueueJob>> {
        let mut conn = self.connection()?;
        let claimed = conn
            .immediate_transaction::<_, diesel::result::Error, _>(|tx_conn| {
                let Some(mut row) = queue_dsl::queue_jobs
                    .filter(queue_dsl::queue.eq(queue))
                    .filter(queue_dsl::status.eq(QueueJobStatus::Waiting.as_str()))
                    .filter(queue_dsl::run_at.le(now_ms))
                    .order((queue_dsl::run_at.asc(), queue_dsl::created_at.asc()))
                    .first::<QueueJobRow>(tx_conn)
                    .optional()?
                else {
                    return Ok(None);
                };

                row.status = QueueJobStatus::Active.as_str().to_string();
                row.attempts_made += 1;
                row.updated_at = now_secs();
                diesel::update(queue_dsl::queue_jobs.filter(queue_dsl::id.eq(&row.id)))
                    .set((
                        queue_dsl::status.eq(&row.status),
                        queue_dsl::attempts_made.eq(row.attempts_made),
                        queue_dsl::updated_at.eq(row.updated_at),
                    ))
                    .execute(tx_conn)?;
                Ok(Some(row))
            })
            .context("Failed to claim queue job")?;

        claimed.map(QueueJob::try_from).transpose()
    }

    /// Completed entries are removed so the id can be enqueued again
    pub fn delete_queue_job(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::delete(queue_dsl::queue_jobs.filter(queue_dsl::id.eq(job_id)))
            .execute(&mut conn)
            .context("Failed to delete queue job")?;
        Ok(affected > 0)
    }

    pub fn reschedule_queue_job(&self, job_id: &str, run_at_ms: i64, error: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(queue_dsl::queue_jobs.filter(queue_dsl::id.eq(job_id)))
            .set((
                queue_dsl::status.eq(QueueJobStatus::Waiting.as_str()),
                queue_dsl::run_at.eq(run_at_ms),
                queue_dsl::last_error.eq(Some(error)),
                queue_dsl::updated_at.eq(now_secs()),
            ))
            .execute(&mut conn)
            .context("Failed to reschedule queue job")?;
        Ok(())
    }

    pub fn fail_queue_job(&self, job_id: &str, error: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(queue_dsl::queue_jobs.filter(queue_dsl::id.eq(job_id)))
            .set((
                queue_dsl::status.eq(QueueJobStatus::Failed.as_str()),
                queue_dsl::last_error.eq(Some(error)),
                queue_dsl::updated_at.eq(now_secs()),
            ))
            .execute(&mut conn)
            .context("Failed to mark queue job failed")?;
        Ok(())
    }

    /// Return entries left active by a previous process to waiting
    pub fn reset_active_queue_jobs(&self, queue: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        diesel::update(
            queue_dsl::queue_jobs
                .filter(queue_dsl::queue.eq(queue))
                .filter(queue_dsl::status.eq(QueueJobStatus::Active.as_str())),
        )
        .set((
            queue_dsl::status.eq(QueueJobStatus::Waiting.as_str()),
            queue_dsl::updated_at.eq(now_secs()),
        ))
        .execute(&mut conn)
        .context("Failed to recover stalled queue jobs")
    }

    /// Delete an entry only if no worker has claimed it yet
    pub fn remove_waiting_queue_job(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::delete(
            queue_dsl::queue_jobs
                .filter(queue_dsl::id.eq(job_id))
                .filter(queue_dsl::status.eq(QueueJobStatus::Waiting.as_str())),
        )
        .execute(&mut conn)
        .context("Failed to remove waiting queue job")?;
        Ok(affected > 0)
    }

    /// Move a failed entry back to waiting with a fresh attempt budget
    pub fn retry_failed_queue_job(&self, job_id: &str, now_ms: i64) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::update(
            queue_dsl::queue_jobs
                .filter(queue_dsl::id.eq(job_id))
                .filter(queue_dsl::status.eq(QueueJobStatus::Failed.as_str())),
        )
        .set((
            queue_dsl::status.eq(QueueJobStatus::Waiting.as_str()),
            queue_dsl::attempts_made.eq(0),
            queue_dsl::run_at.eq(now_ms),
            queue_dsl::updated_at.eq(now_secs()),
        ))
        .execute(&mut conn)
        .context("Failed to retry queue job")?;
        Ok(affected > 0)
    }

    pub fn count_queue_jobs(&self, queue: &str, status: QueueJobStatus) -> Result<i64> {
        let mut conn = self.connection()?;
        queue_dsl::queue_jobs
            .filter(queue_dsl::queue.eq(queue))
            .filter(queue_dsl::status.eq(status.as_str()))
            .count()
            .get_result(&mut conn)
            .context("Failed to count queue jobs")
    }
}

// ===== Row Types =====

#[derive(Queryable, Insertable)]
#[diesel(table_name = queue_jobs)]
struct QueueJobRow {
    id: String,
    queue: String,
    payload: String,
    status: String,
    attempts_made: i32,
    max_attempts: i32,
    run_at: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<&QueueJob> for QueueJobRow {
    type Error = anyhow::Error;

    fn try_from(job: &QueueJob) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            queue: job.queue.clone(),
            payload: serde_json::to_string(&job.payload).context("Failed to encode queue payload")?,
            status: job.status.as_str().to_string(),
            attempts_made: job.attempts_made as i32,
            max_attempts: job.max_attempts as i32,
            run_at: job.run_at,
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }
}

impl TryFrom<QueueJobRow> for QueueJob {
    type Error = anyhow::Error;

    fn try_from(row: QueueJobRow) -> Result<Self> {
        let status = QueueJobStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("Unknown queue job status: {}", row.status))?;
        Ok(QueueJob {
            id: row.id,
            queue: row.queue,
            payload: serde_json::from_str(&row.payload).context("Failed to decode queue payload")?,
            status,
            attempts_made: row.attempts_made.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            run_at: row.run_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
