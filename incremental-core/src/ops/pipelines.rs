use std::str::FromStr;

use sqlx::PgConnection;

use crate::error::PipelineError;
use crate::ops::catalog;
use crate::types::{Pipeline, PipelineKind};

#[derive(sqlx::FromRow)]
struct PipelineRow {
    pipeline_name: String,
    pipeline_kind: String,
    owner_role: String,
    source_relation: Option<String>,
    command: String,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = PipelineError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        Ok(Pipeline {
            name: row.pipeline_name,
            kind: PipelineKind::from_str(&row.pipeline_kind)?,
            owner: row.owner_role,
            source: row.source_relation,
            command: row.command,
        })
    }
}

pub async fn insert_pipeline<'c, E>(executor: E, pipeline: &Pipeline) -> Result<(), PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query(
        r#"
INSERT INTO incremental.pipelines (pipeline_name, pipeline_kind, owner_role, source_oid, command)
VALUES ($1, $2, $3, pg_catalog.to_regclass($4)::oid, $5)
        "#,
    )
    .bind(&pipeline.name)
    .bind(pipeline.kind.as_str())
    .bind(&pipeline.owner)
    .bind(&pipeline.source)
    .bind(&pipeline.command)
    .execute(executor)
    .await;

    match res {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(PipelineError::AlreadyExists(pipeline.name.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_pipeline<'c, E>(executor: E, name: &str) -> Result<Option<Pipeline>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row: Option<PipelineRow> = sqlx::query_as(
        r#"
SELECT pipeline_name, pipeline_kind, owner_role,
       incremental.relation_name(source_oid) AS source_relation, command
FROM incremental.pipelines
WHERE pipeline_name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(executor)
    .await?;

    row.map(Pipeline::try_from).transpose()
}

// Watermark and ledger rows go with it through the foreign key cascade
pub async fn delete_pipeline<'c, E>(executor: E, name: &str) -> Result<bool, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let res = sqlx::query("DELETE FROM incremental.pipelines WHERE pipeline_name = $1")
        .bind(name)
        .execute(executor)
        .await?;

    Ok(res.rows_affected() > 0)
}

// Matches on the relation's oid, given as a number or as a name that still resolves
pub async fn pipelines_by_source(
    conn: &mut PgConnection,
    object: &str,
) -> Result<Vec<String>, PipelineError> {
    let oid = match object.parse::<u32>() {
        Ok(oid) => Some(i64::from(oid)),
        Err(_) => catalog::relation_oid(&mut *conn, object).await?,
    };
    let Some(oid) = oid else {
        return Ok(Vec::new());
    };

    let names: Vec<String> =
        sqlx::query_scalar("SELECT incremental.pipelines_for_source($1::oid)")
            .bind(oid)
            .fetch_all(&mut *conn)
            .await?;

    Ok(names)
}
