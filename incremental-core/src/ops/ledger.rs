use std::collections::HashSet;

use crate::error::PipelineError;

pub async fn processed_files<'c, E>(
    executor: E,
    pipeline: &str,
) -> Result<HashSet<String>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let paths: Vec<String> =
        sqlx::query_scalar("SELECT path FROM incremental.processed_files WHERE pipeline_name = $1")
            .bind(pipeline)
            .fetch_all(executor)
            .await?;

    Ok(paths.into_iter().collect())
}

pub async fn record_processed_files<'c, E>(
    executor: E,
    pipeline: &str,
    paths: &[String],
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO incremental.processed_files (pipeline_name, path)
SELECT $1, path FROM unnest($2::text[]) AS path
ON CONFLICT (pipeline_name, path) DO NOTHING
        "#,
    )
    .bind(pipeline)
    .bind(paths)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn clear_processed_files<'c, E>(executor: E, pipeline: &str) -> Result<u64, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query("DELETE FROM incremental.processed_files WHERE pipeline_name = $1")
        .bind(pipeline)
        .execute(executor)
        .await?;

    Ok(res.rows_affected())
}
