use sqlx::PgConnection;

use crate::error::PipelineError;
use crate::types::{CounterPosition, SourceObject};

// Every relation name leaving this module is rendered as quote_ident(schema).quote_ident(name).
// Stored pipelines keep oids and render names the same way through incremental.relation_name.

#[derive(sqlx::FromRow)]
struct RelationRow {
    oid: i64,
    relkind: String,
    name: String,
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    origin: i64,
    last_value: Option<i64>,
}

pub async fn describe_source(
    conn: &mut PgConnection,
    reference: &str,
) -> Result<Option<SourceObject>, PipelineError> {
    let relation: Option<RelationRow> = sqlx::query_as(
        r#"
SELECT c.oid::bigint AS oid, c.relkind::text AS relkind,
       quote_ident(n.nspname) || '.' || quote_ident(c.relname) AS name
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE c.oid = pg_catalog.to_regclass($1)
        "#,
    )
    .bind(reference)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(relation) = relation else {
        return Ok(None);
    };

    let object = match relation.relkind.as_str() {
        "S" => {
            let owned_by: Option<String> = sqlx::query_scalar(
                r#"
SELECT quote_ident(n.nspname) || '.' || quote_ident(t.relname)
FROM pg_catalog.pg_depend d
JOIN pg_catalog.pg_class t ON t.oid = d.refobjid
JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
WHERE d.classid = 'pg_catalog.pg_class'::regclass
  AND d.refclassid = 'pg_catalog.pg_class'::regclass
  AND d.objid = $1::oid
  AND d.deptype IN ('a', 'i')
LIMIT 1
                "#,
            )
            .bind(relation.oid)
            .fetch_optional(&mut *conn)
            .await?;

            SourceObject::Sequence {
                name: relation.name,
                owned_by,
            }
        }
        "r" | "p" | "f" => {
            let owned_sequences: Vec<String> = sqlx::query_scalar(
                r#"
SELECT quote_ident(n.nspname) || '.' || quote_ident(s.relname)
FROM pg_catalog.pg_depend d
JOIN pg_catalog.pg_class s ON s.oid = d.objid AND s.relkind = 'S'
JOIN pg_catalog.pg_namespace n ON n.oid = s.relnamespace
WHERE d.classid = 'pg_catalog.pg_class'::regclass
  AND d.refclassid = 'pg_catalog.pg_class'::regclass
  AND d.refobjid = $1::oid
  AND d.deptype IN ('a', 'i')
ORDER BY 1
                "#,
            )
            .bind(relation.oid)
            .fetch_all(&mut *conn)
            .await?;

            SourceObject::Table {
                name: relation.name,
                owned_sequences,
            }
        }
        other => SourceObject::Other {
            name: relation.name,
            kind: relkind_name(other).to_string(),
        },
    };

    Ok(Some(object))
}

fn relkind_name(relkind: &str) -> &'static str {
    match relkind {
        "v" => "view",
        "m" => "materialized view",
        "i" | "I" => "index",
        "c" => "composite type",
        "t" => "TOAST table",
        _ => "relation",
    }
}

pub async fn counter_position<'c, E>(
    executor: E,
    counter: &str,
) -> Result<CounterPosition, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row: Option<PositionRow> = sqlx::query_as(
        r#"
SELECT s.seqmin AS origin, pg_catalog.pg_sequence_last_value(s.seqrelid) AS last_value
FROM pg_catalog.pg_sequence s
WHERE s.seqrelid = pg_catalog.to_regclass($1)
        "#,
    )
    .bind(counter)
    .fetch_optional(executor)
    .await?;

    let row = row.ok_or_else(|| {
        PipelineError::invalid(format!("sequence {counter} does not exist"))
    })?;

    Ok(CounterPosition {
        origin: row.origin,
        last_value: row.last_value,
    })
}

pub async fn has_counter_access<'c, E>(
    executor: E,
    role: &str,
    counter: &str,
) -> Result<bool, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let allowed: bool =
        sqlx::query_scalar("SELECT pg_catalog.has_sequence_privilege($1::name, $2, 'USAGE, UPDATE')")
            .bind(role)
            .bind(counter)
            .fetch_one(executor)
            .await?;

    Ok(allowed)
}

// Listing functions are looked up by their single text argument signature
pub async fn resolve_list_function<'c, E>(
    executor: E,
    name: &str,
) -> Result<Option<String>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let resolved: Option<String> = sqlx::query_scalar(
        r#"
SELECT quote_ident(n.nspname) || '.' || quote_ident(p.proname)
FROM pg_catalog.pg_proc p
JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
WHERE p.oid = pg_catalog.to_regprocedure($1 || '(text)')
        "#,
    )
    .bind(name)
    .fetch_optional(executor)
    .await?;

    Ok(resolved)
}

pub async fn relation_oid<'c, E>(executor: E, relation: &str) -> Result<Option<i64>, PipelineError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let oid: Option<i64> = sqlx::query_scalar("SELECT pg_catalog.to_regclass($1)::oid::bigint")
        .bind(relation)
        .fetch_one(executor)
        .await?;

    Ok(oid)
}
