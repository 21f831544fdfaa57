use super::InventoryDb;
use crate::activity::{Job, JobStatus};
use crate::inventory::schema::jobs::{self, dsl as jobs_dsl};
use anyhow::{Context, Result, anyhow};
use diesel::prelude::*;

impl InventoryDb {
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.connection()?;
        let row = JobRow::try_from(job)?;
        diesel::insert_into(jobs::table)
            .values(&row)
            .execute(&mut conn)
            .context("Failed to insert job")?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.connection()?;
        let row = jobs_dsl::jobs
            .filter(jobs_dsl::id.eq(job_id))
            .first::<JobRow>(&mut conn)
            .optional()
            .context("Failed to query job")?;
        row.map(Job::try_from).transpose()
    }

    /// Read-modify-write a job in one write transaction so concurrent
    /// metadata merges never drop keys. `apply` returns whether to persist.
    /// Returns None when the job does not exist.
    pub fn modify_job<F>(&self, job_id: &str, apply: F) -> Result<Option<(Job, bool)>>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut conn = self.connection()?;
        conn.immediate_transaction::<_, anyhow::Error, _>(|tx_conn| {
            let Some(row) = jobs_dsl::jobs
                .filter(jobs_dsl::id.eq(job_id))
                .first::<JobRow>(tx_conn)
                .optional()?
            else {
                return Ok(None);
            };

            let mut job = Job::try_from(row)?;
            if !apply(&mut job) {
                return Ok(Some((job, false)));
            }

            let metadata = serde_json::to_string(&job.metadata)?;
            diesel::update(jobs_dsl::jobs.filter(jobs_dsl::id.eq(job_id)))
                .set((
                    jobs_dsl::status.eq(job.status.as_str()),
                    jobs_dsl::progress.eq(job.progress),
                    jobs_dsl::message.eq(&job.message),
                    jobs_dsl::metadata.eq(metadata),
                    jobs_dsl::updated_at.eq(job.updated_at),
                ))
                .execute(tx_conn)?;
            Ok(Some((job, true)))
        })
        .context("Failed to update job")
    }

    /// Jobs of a workspace in the given statuses, newest first
    pub fn list_jobs(&self, workspace_id: &str, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let mut conn = self.connection()?;
        let statuses: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
        let rows = jobs_dsl::jobs
            .filter(jobs_dsl::workspace_id.eq(workspace_id))
            .filter(jobs_dsl::status.eq_any(statuses))
            .order(jobs_dsl::created_at.desc())
            .load::<JobRow>(&mut conn)
            .context("Failed to list jobs")?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

// ===== Row Types =====

#[derive(Queryable, Insertable)]
#[diesel(table_name = jobs)]
struct JobRow {
    id: String,
    workspace_id: String,
    job_type: String,
    title: String,
    message: Option<String>,
    status: String,
    progress: f64,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<&Job> for JobRow {
    type Error = anyhow::Error;

    fn try_from(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            workspace_id: job.workspace_id.clone(),
            job_type: job.job_type.clone(),
            title: job.title.clone(),
            message: job.message.clone(),
            status: job.status.as_str().to_string(),
            progress: job.progress,
            metadata: serde_json::to_string(&job.metadata).context("Failed to encode job metadata")?,
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let status =
            JobStatus::parse(&row.status).ok_or_else(|| anyhow!("Unknown job status: {}", row.status))?;
        let metadata = serde_json::from_str(&row.metadata).context("Failed to decode job metadata")?;
        Ok(Job {
            id: row.id,
            workspace_id: row.workspace_id,
            job_type: row.job_type,
            title: row.title,
            message: row.message,
            status,
            progress: row.progress,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
