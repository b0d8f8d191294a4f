use chrono::{DateTime, Utc};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduledJobRow {
    pub job_id: i64,
    pub job_name: String,
    pub schedule: String,
    pub pipeline_name: String,
    pub owner_role: String,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

// Re-scheduling an existing job name replaces its schedule but keeps its id
pub async fn upsert_job<'c, E>(
    executor: E,
    job_name: &str,
    schedule: &str,
    pipeline_name: &str,
    owner_role: &str,
) -> Result<i64, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let job_id: i64 = sqlx::query_scalar(
        r#"
INSERT INTO incremental.scheduled_jobs (job_name, schedule, pipeline_name, owner_role)
VALUES ($1, $2, $3, $4)
ON CONFLICT (job_name) DO UPDATE
SET schedule = EXCLUDED.schedule,
    pipeline_name = EXCLUDED.pipeline_name,
    owner_role = EXCLUDED.owner_role
RETURNING job_id
        "#,
    )
    .bind(job_name)
    .bind(schedule)
    .bind(pipeline_name)
    .bind(owner_role)
    .fetch_one(executor)
    .await?;

    Ok(job_id)
}

pub async fn delete_job<'c, E>(executor: E, job_name: &str) -> Result<bool, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query("DELETE FROM incremental.scheduled_jobs WHERE job_name = $1")
        .bind(job_name)
        .execute(executor)
        .await?;

    Ok(res.rows_affected() > 0)
}

pub async fn list_jobs<'c, E>(executor: E) -> Result<Vec<ScheduledJobRow>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let jobs = sqlx::query_as(
        r#"
SELECT job_id, job_name, schedule, pipeline_name, owner_role, created_at, last_run_at
FROM incremental.scheduled_jobs
ORDER BY job_id
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(jobs)
}

// Claims a run only if nobody else recorded one since we read the job, so concurrent runners
// never start the same tick twice
pub async fn claim_job_run<'c, E>(
    executor: E,
    job_id: i64,
    previous_run: Option<DateTime<Utc>>,
    run_at: DateTime<Utc>,
) -> Result<bool, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        r#"
UPDATE incremental.scheduled_jobs
SET last_run_at = $3
WHERE job_id = $1 AND last_run_at IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(job_id)
    .bind(previous_run)
    .bind(run_at)
    .execute(executor)
    .await?;

    Ok(res.rows_affected() > 0)
}
