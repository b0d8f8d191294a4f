use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgTypeInfo;
use sqlx::{Either, Executor, PgPool, Postgres, Statement, Type};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{EngineConfig, PoolConfig};
use crate::error::{CommandError, PipelineError};
use crate::ops::{catalog, ledger, locks, meta, pipelines, state};
use crate::store::{PipelineStore, PipelineTransaction};
use crate::types::{
    Caller, CommandParams, CounterPosition, ParamShape, Pipeline, PipelineState,
    ServicePrincipal, SourceObject,
};

const QUERY_CANCELED: &str = "57014";

const MIN_WRITER_POLL: Duration = Duration::from_millis(5);
const MAX_WRITER_POLL: Duration = Duration::from_millis(250);

/// Pipeline storage backed by the `incremental` schema of a PostgreSQL database.
#[derive(Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
    command_timeout: Option<Duration>,
}

impl PgPipelineStore {
    pub async fn new(pool: PoolConfig, config: &EngineConfig) -> Result<Self, PipelineError> {
        let pool = pool.connect().await?;
        Ok(Self::from_pool(pool, config))
    }

    pub fn from_pool(pool: PgPool, config: &EngineConfig) -> Self {
        Self {
            pool,
            command_timeout: config.command_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), PipelineError> {
        meta::run_migrations(&self.pool).await
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    type Transaction = PgPipelineTransaction;

    async fn begin(
        &self,
        principal: &ServicePrincipal,
    ) -> Result<PgPipelineTransaction, PipelineError> {
        let mut txn = self.pool.begin().await?;
        if let Some(role) = &principal.role {
            meta::set_local(&mut *txn, "role", role).await?;
        }

        Ok(PgPipelineTransaction {
            txn,
            principal_role: principal.role.clone(),
            command_timeout: self.command_timeout,
        })
    }
}

pub struct PgPipelineTransaction {
    txn: sqlx::Transaction<'static, Postgres>,
    principal_role: Option<String>,
    command_timeout: Option<Duration>,
}

impl PgPipelineTransaction {
    async fn savepoint(&mut self, name: &str) -> Result<(), PipelineError> {
        let statement = format!("SAVEPOINT {name}");
        sqlx::query(&statement).execute(&mut *self.txn).await?;
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<(), PipelineError> {
        let statement = format!("ROLLBACK TO SAVEPOINT {name}");
        sqlx::query(&statement).execute(&mut *self.txn).await?;
        Ok(())
    }

    async fn release(&mut self, name: &str) -> Result<(), PipelineError> {
        let statement = format!("RELEASE SAVEPOINT {name}");
        sqlx::query(&statement).execute(&mut *self.txn).await?;
        Ok(())
    }

    async fn become_caller(&mut self, caller: &Caller) -> Result<(), PipelineError> {
        meta::set_local(&mut *self.txn, "role", &caller.role).await
    }

    async fn become_principal(&mut self) -> Result<(), PipelineError> {
        let role = self.principal_role.as_deref().unwrap_or("none");
        meta::set_local(&mut *self.txn, "role", role).await
    }
}

fn param_types(shape: ParamShape) -> Vec<PgTypeInfo> {
    match shape {
        ParamShape::BigintRange => vec![<i64 as Type<Postgres>>::type_info(); 2],
        ParamShape::TimestampRange => vec![<DateTime<Utc> as Type<Postgres>>::type_info(); 2],
        ParamShape::Path => vec![<String as Type<Postgres>>::type_info()],
        ParamShape::PathArray => vec![<Vec<String> as Type<Postgres>>::type_info()],
    }
}

fn millis(timeout: Duration) -> String {
    // 0 disables the timeout entirely
    format!("{}ms", timeout.as_millis().max(1))
}

fn command_error(error: sqlx::Error) -> CommandError {
    match &error {
        sqlx::Error::Database(e) if e.code().as_deref() == Some(QUERY_CANCELED) => {
            CommandError::cancelled(e.message())
        }
        sqlx::Error::Database(e) => CommandError::new(e.message()),
        _ => CommandError::new(error.to_string()),
    }
}

#[async_trait]
impl PipelineTransaction for PgPipelineTransaction {
    async fn insert_pipeline(&mut self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        pipelines::insert_pipeline(&mut *self.txn, pipeline).await
    }

    async fn get_pipeline(&mut self, name: &str) -> Result<Option<Pipeline>, PipelineError> {
        pipelines::get_pipeline(&mut *self.txn, name).await
    }

    async fn delete_pipeline(&mut self, name: &str) -> Result<bool, PipelineError> {
        pipelines::delete_pipeline(&mut *self.txn, name).await
    }

    async fn pipelines_by_source(&mut self, object: &str) -> Result<Vec<String>, PipelineError> {
        pipelines::pipelines_by_source(&mut self.txn, object).await
    }

    async fn describe_source(
        &mut self,
        reference: &str,
    ) -> Result<Option<SourceObject>, PipelineError> {
        catalog::describe_source(&mut self.txn, reference).await
    }

    async fn resolve_list_function(
        &mut self,
        name: &str,
    ) -> Result<Option<String>, PipelineError> {
        catalog::resolve_list_function(&mut *self.txn, name).await
    }

    async fn validate_command(
        &mut self,
        command: &str,
        shape: ParamShape,
    ) -> Result<(), PipelineError> {
        const SAVEPOINT: &str = "incremental_validate_command";

        // Parsing through the extended protocol rejects multi-statement commands
        let types = param_types(shape);
        self.savepoint(SAVEPOINT).await?;
        let parameters = match (&mut *self.txn).prepare_with(command, &types).await {
            Ok(statement) => match statement.parameters() {
                Some(Either::Left(params)) => params.len(),
                Some(Either::Right(count)) => count,
                None => 0,
            },
            Err(sqlx::Error::Database(e)) => {
                self.rollback_to(SAVEPOINT).await?;
                return Err(PipelineError::invalid(format!(
                    "invalid command: {}",
                    e.message()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        self.release(SAVEPOINT).await?;

        if parameters > shape.arity() {
            return Err(PipelineError::invalid(format!(
                "command uses {parameters} parameters, but only {} are supplied",
                shape.arity()
            )));
        }

        Ok(())
    }

    async fn has_counter_access(
        &mut self,
        caller: &Caller,
        counter: &str,
    ) -> Result<bool, PipelineError> {
        catalog::has_counter_access(&mut *self.txn, &caller.role, counter).await
    }

    async fn insert_state(
        &mut self,
        pipeline: &str,
        state: &PipelineState,
    ) -> Result<(), PipelineError> {
        state::insert_state(&mut *self.txn, pipeline, state).await
    }

    async fn get_state(&mut self, pipeline: &Pipeline) -> Result<PipelineState, PipelineError> {
        state::get_state(&mut *self.txn, pipeline, false).await
    }

    async fn lock_state(&mut self, pipeline: &Pipeline) -> Result<PipelineState, PipelineError> {
        state::get_state(&mut *self.txn, pipeline, true).await
    }

    async fn set_sequence_watermark(
        &mut self,
        pipeline: &str,
        last_processed: Option<i64>,
    ) -> Result<(), PipelineError> {
        state::set_sequence_watermark(&mut *self.txn, pipeline, last_processed).await
    }

    async fn set_time_interval_watermark(
        &mut self,
        pipeline: &str,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<(), PipelineError> {
        state::set_time_interval_watermark(&mut *self.txn, pipeline, last_processed).await
    }

    async fn processed_files(&mut self, pipeline: &str) -> Result<HashSet<String>, PipelineError> {
        ledger::processed_files(&mut *self.txn, pipeline).await
    }

    async fn record_processed_files(
        &mut self,
        pipeline: &str,
        paths: &[String],
    ) -> Result<(), PipelineError> {
        ledger::record_processed_files(&mut *self.txn, pipeline, paths).await
    }

    async fn clear_processed_files(&mut self, pipeline: &str) -> Result<u64, PipelineError> {
        ledger::clear_processed_files(&mut *self.txn, pipeline).await
    }

    async fn counter_position(&mut self, counter: &str) -> Result<CounterPosition, PipelineError> {
        catalog::counter_position(&mut *self.txn, counter).await
    }

    async fn wait_for_writers(
        &mut self,
        relation: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let oid = catalog::relation_oid(&mut *self.txn, relation)
            .await?
            .ok_or_else(|| PipelineError::invalid(format!("relation {relation} does not exist")))?;

        // Only transactions already writing at this point are waited for, new writers go ahead
        let writers = locks::writers_in_flight(&mut *self.txn, oid).await?;
        if writers.is_empty() {
            debug!(%relation, "no writers in flight");
            return Ok(());
        }

        debug!(%relation, writers = writers.len(), "waiting for writers in flight");
        let deadline = Instant::now() + timeout;
        let mut pause = MIN_WRITER_POLL;
        while locks::still_running(&mut *self.txn, &writers).await? > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::ResolutionTimeout {
                    relation: relation.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(pause.min(deadline - now)).await;
            pause = (pause * 2).min(MAX_WRITER_POLL);
        }

        Ok(())
    }

    async fn now(&mut self) -> Result<DateTime<Utc>, PipelineError> {
        meta::transaction_now(&mut *self.txn).await
    }

    async fn list_files(
        &mut self,
        caller: &Caller,
        function: &str,
        pattern: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let function = catalog::resolve_list_function(&mut *self.txn, function)
            .await?
            .ok_or_else(|| {
                PipelineError::invalid(format!("function {function}(text) does not exist"))
            })?;

        self.become_caller(caller).await?;
        let query = format!("SELECT f::text FROM {function}($1) AS f");
        let files: Vec<String> = sqlx::query_scalar(&query)
            .bind(pattern)
            .fetch_all(&mut *self.txn)
            .await?;
        self.become_principal().await?;

        Ok(files)
    }

    async fn run_command(
        &mut self,
        pipeline: &Pipeline,
        caller: &Caller,
        params: &CommandParams,
    ) -> Result<(), PipelineError> {
        let previous_timeout = match self.command_timeout {
            Some(timeout) => {
                let previous = meta::current_setting(&mut *self.txn, "statement_timeout").await?;
                meta::set_local(&mut *self.txn, "statement_timeout", &millis(timeout)).await?;
                Some(previous)
            }
            None => None,
        };
        self.become_caller(caller).await?;

        let query = sqlx::query(&pipeline.command);
        let query = match params {
            CommandParams::Range(start, end) => query.bind(*start).bind(*end),
            CommandParams::TimeRange(start, end) => query.bind(*start).bind(*end),
            CommandParams::File(path) => query.bind(path),
            CommandParams::Files(paths) => query.bind(paths),
        };

        if let Err(e) = query.execute(&mut *self.txn).await {
            return Err(PipelineError::CommandFailed {
                pipeline: pipeline.name.clone(),
                source: command_error(e),
            });
        }

        self.become_principal().await?;
        if let Some(previous) = previous_timeout {
            meta::set_local(&mut *self.txn, "statement_timeout", &previous).await?;
        }

        Ok(())
    }

    async fn commit(self) -> Result<(), PipelineError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), PipelineError> {
        self.txn.rollback().await?;
        Ok(())
    }
}
