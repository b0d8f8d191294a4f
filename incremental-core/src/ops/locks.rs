use crate::error::PipelineError;

// Virtual transaction ids of other sessions holding a lock on the relation that allows writing.
// Reading pg_locks never queues behind anything, so new writers are not held up.
pub async fn writers_in_flight<'c, E>(
    executor: E,
    relation: i64,
) -> Result<Vec<String>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let writers: Vec<String> = sqlx::query_scalar(
        r#"
SELECT DISTINCT l.virtualtransaction
FROM pg_catalog.pg_locks l
WHERE l.locktype = 'relation'
  AND l.database = (SELECT oid FROM pg_catalog.pg_database WHERE datname = pg_catalog.current_database())
  AND l.relation = $1::oid
  AND l.granted
  AND l.mode IN ('RowExclusiveLock', 'ShareUpdateExclusiveLock', 'ShareRowExclusiveLock',
                 'ExclusiveLock', 'AccessExclusiveLock')
  AND l.pid IS DISTINCT FROM pg_catalog.pg_backend_pid()
ORDER BY 1
        "#,
    )
    .bind(relation)
    .fetch_all(executor)
    .await?;

    Ok(writers)
}

// How many of the given transactions still hold any lock. A live transaction always holds its
// own virtualxid, a prepared one keeps its relation locks until it is resolved.
pub async fn still_running<'c, E>(
    executor: E,
    transactions: &[String],
) -> Result<i64, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let running: i64 = sqlx::query_scalar(
        r#"
SELECT count(DISTINCT virtualtransaction)
FROM pg_catalog.pg_locks
WHERE virtualtransaction = ANY($1)
        "#,
    )
    .bind(transactions)
    .fetch_one(executor)
    .await?;

    Ok(running)
}
