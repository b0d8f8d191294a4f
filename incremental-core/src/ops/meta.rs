use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::PipelineError;

pub async fn run_migrations(pool: &PgPool) -> Result<(), PipelineError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PipelineError::SqlxError(e.into()))
}

// Transaction start time, so every read in one unit of work agrees on "now"
pub async fn transaction_now<'c, E>(executor: E) -> Result<DateTime<Utc>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
        .fetch_one(executor)
        .await?;

    Ok(now)
}

// Equivalent of SET LOCAL, scoped to the current transaction
pub async fn set_local<'c, E>(executor: E, setting: &str, value: &str) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("SELECT pg_catalog.set_config($1, $2, true)")
        .bind(setting)
        .bind(value)
        .execute(executor)
        .await?;

    Ok(())
}

pub async fn current_setting<'c, E>(executor: E, setting: &str) -> Result<String, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let value: String = sqlx::query_scalar("SELECT pg_catalog.current_setting($1)")
        .bind(setting)
        .fetch_one(executor)
        .await?;

    Ok(value)
}
