use chrono::{DateTime, Duration, Utc};

use crate::error::PipelineError;
use crate::types::{
    FileListState, Pipeline, PipelineKind, PipelineState, SequenceState, TimeIntervalState,
};

#[derive(sqlx::FromRow)]
struct SequenceRow {
    sequence_name: String,
    relation_name: String,
    last_processed_sequence_number: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct TimeIntervalRow {
    time_interval_us: i64,
    start_time: DateTime<Utc>,
    min_delay_us: i64,
    batched: bool,
    last_processed_time: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct FileListRow {
    file_pattern: String,
    batched: bool,
    list_function: String,
    max_batch_size: Option<i32>,
}

fn micros(name: &str, value: Duration) -> Result<i64, PipelineError> {
    value
        .num_microseconds()
        .ok_or_else(|| PipelineError::invalid(format!("{name} is out of range")))
}

pub async fn insert_state<'c, E>(
    executor: E,
    pipeline: &str,
    state: &PipelineState,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    match state {
        PipelineState::Sequence(state) => {
            sqlx::query(
                r#"
INSERT INTO incremental.sequence_pipelines
    (pipeline_name, sequence_oid, relation_oid, last_processed_sequence_number)
VALUES ($1, pg_catalog.to_regclass($2)::oid, pg_catalog.to_regclass($3)::oid, $4)
                "#,
            )
            .bind(pipeline)
            .bind(&state.counter)
            .bind(&state.relation)
            .bind(state.last_processed)
            .execute(executor)
            .await?;
        }
        PipelineState::TimeInterval(state) => {
            sqlx::query(
                r#"
INSERT INTO incremental.time_interval_pipelines
    (pipeline_name, time_interval_us, start_time, min_delay_us, batched, last_processed_time)
VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(pipeline)
            .bind(micros("interval", state.interval)?)
            .bind(state.anchor)
            .bind(micros("min_delay", state.min_delay)?)
            .bind(state.batched)
            .bind(state.last_processed)
            .execute(executor)
            .await?;
        }
        PipelineState::FileList(state) => {
            sqlx::query(
                r#"
INSERT INTO incremental.file_list_pipelines
    (pipeline_name, file_pattern, batched, list_function, max_batch_size)
VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(pipeline)
            .bind(&state.pattern)
            .bind(state.batched)
            .bind(&state.list_function)
            .bind(state.max_batch_size)
            .execute(executor)
            .await?;
        }
    }

    Ok(())
}

// Reads the kind-specific row of a pipeline, optionally taking a row lock on it
pub async fn get_state<'c, E>(
    executor: E,
    pipeline: &Pipeline,
    for_update: bool,
) -> Result<PipelineState, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let not_found = || PipelineError::NotFound(pipeline.name.clone());

    let state = match pipeline.kind {
        PipelineKind::Sequence => {
            let query = format!(
                "SELECT incremental.relation_name(sequence_oid) AS sequence_name, \
                 incremental.relation_name(relation_oid) AS relation_name, \
                 last_processed_sequence_number \
                 FROM incremental.sequence_pipelines WHERE pipeline_name = $1{lock}"
            );
            let row: SequenceRow = sqlx::query_as(&query)
                .bind(&pipeline.name)
                .fetch_optional(executor)
                .await?
                .ok_or_else(not_found)?;

            PipelineState::Sequence(SequenceState {
                counter: row.sequence_name,
                relation: row.relation_name,
                last_processed: row.last_processed_sequence_number,
            })
        }
        PipelineKind::TimeInterval => {
            let query = format!(
                "SELECT time_interval_us, start_time, min_delay_us, batched, last_processed_time \
                 FROM incremental.time_interval_pipelines WHERE pipeline_name = $1{lock}"
            );
            let row: TimeIntervalRow = sqlx::query_as(&query)
                .bind(&pipeline.name)
                .fetch_optional(executor)
                .await?
                .ok_or_else(not_found)?;

            PipelineState::TimeInterval(TimeIntervalState {
                interval: Duration::microseconds(row.time_interval_us),
                anchor: row.start_time,
                min_delay: Duration::microseconds(row.min_delay_us),
                batched: row.batched,
                last_processed: row.last_processed_time,
            })
        }
        PipelineKind::FileList => {
            let query = format!(
                "SELECT file_pattern, batched, list_function, max_batch_size \
                 FROM incremental.file_list_pipelines WHERE pipeline_name = $1{lock}"
            );
            let row: FileListRow = sqlx::query_as(&query)
                .bind(&pipeline.name)
                .fetch_optional(executor)
                .await?
                .ok_or_else(not_found)?;

            PipelineState::FileList(FileListState {
                pattern: row.file_pattern,
                batched: row.batched,
                list_function: row.list_function,
                max_batch_size: row.max_batch_size,
            })
        }
    };

    Ok(state)
}

pub async fn set_sequence_watermark<'c, E>(
    executor: E,
    pipeline: &str,
    last_processed: Option<i64>,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        r#"
UPDATE incremental.sequence_pipelines
SET last_processed_sequence_number = $2
WHERE pipeline_name = $1
        "#,
    )
    .bind(pipeline)
    .bind(last_processed)
    .execute(executor)
    .await?;

    throw_if_no_rows(res.rows_affected(), pipeline)
}

pub async fn set_time_interval_watermark<'c, E>(
    executor: E,
    pipeline: &str,
    last_processed: Option<DateTime<Utc>>,
) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        r#"
UPDATE incremental.time_interval_pipelines
SET last_processed_time = $2
WHERE pipeline_name = $1
        "#,
    )
    .bind(pipeline)
    .bind(last_processed)
    .execute(executor)
    .await?;

    throw_if_no_rows(res.rows_affected(), pipeline)
}

fn throw_if_no_rows(rows: u64, pipeline: &str) -> Result<(), PipelineError> {
    if rows == 0 {
        Err(PipelineError::NotFound(pipeline.to_string()))
    } else {
        Ok(())
    }
}
