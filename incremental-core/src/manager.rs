use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::executor::Executor;
use crate::schedule::{job_name_for, parse_schedule, JobSpec, Scheduler};
use crate::store::{PipelineStore, PipelineTransaction};
use crate::types::{
    default_anchor, Caller, ExecutionOutcome, FileListState, ParamShape, Pipeline,
    PipelineDescription, PipelineKind, PipelineState, SequenceState, ServicePrincipal,
    SourceObject, TimeIntervalState,
};

pub const DEFAULT_SCHEDULE: &str = "* * * * *";
pub const DEFAULT_MIN_DELAY_SECONDS: i64 = 30;

#[derive(Debug, Clone)]
pub struct NewSequencePipeline {
    pub name: String,
    // A sequence owned by a table, or a table owning exactly one sequence
    pub counter: String,
    pub command: String,
    pub schedule: Option<String>,
    pub execute_immediately: bool,
}

impl NewSequencePipeline {
    pub fn new(
        name: impl Into<String>,
        counter: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            counter: counter.into(),
            command: command.into(),
            schedule: Some(DEFAULT_SCHEDULE.to_string()),
            execute_immediately: true,
        }
    }

    pub fn schedule(mut self, schedule: Option<&str>) -> Self {
        self.schedule = schedule.map(str::to_string);
        self
    }

    pub fn execute_immediately(mut self, execute_immediately: bool) -> Self {
        self.execute_immediately = execute_immediately;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewTimeIntervalPipeline {
    pub name: String,
    pub interval: Duration,
    pub command: String,
    pub batched: bool,
    pub start_time: Option<DateTime<Utc>>,
    // Relation whose in-flight writers are waited for before a window is processed
    pub source: Option<String>,
    pub schedule: Option<String>,
    pub min_delay: Duration,
    pub execute_immediately: bool,
}

impl NewTimeIntervalPipeline {
    pub fn new(name: impl Into<String>, interval: Duration, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval,
            command: command.into(),
            batched: true,
            start_time: None,
            source: None,
            schedule: Some(DEFAULT_SCHEDULE.to_string()),
            min_delay: Duration::seconds(DEFAULT_MIN_DELAY_SECONDS),
            execute_immediately: true,
        }
    }

    pub fn batched(mut self, batched: bool) -> Self {
        self.batched = batched;
        self
    }

    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    pub fn schedule(mut self, schedule: Option<&str>) -> Self {
        self.schedule = schedule.map(str::to_string);
        self
    }

    pub fn execute_immediately(mut self, execute_immediately: bool) -> Self {
        self.execute_immediately = execute_immediately;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewFileListPipeline {
    pub name: String,
    pub pattern: String,
    pub command: String,
    pub batched: bool,
    // Falls back to the engine's default list function
    pub list_function: Option<String>,
    pub max_batch_size: Option<i32>,
    pub schedule: Option<String>,
    pub execute_immediately: bool,
}

impl NewFileListPipeline {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            command: command.into(),
            batched: false,
            list_function: None,
            max_batch_size: None,
            schedule: Some(DEFAULT_SCHEDULE.to_string()),
            execute_immediately: true,
        }
    }

    pub fn batched(mut self, batched: bool) -> Self {
        self.batched = batched;
        self
    }

    pub fn list_function(mut self, list_function: impl Into<String>) -> Self {
        self.list_function = Some(list_function.into());
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: i32) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    pub fn schedule(mut self, schedule: Option<&str>) -> Self {
        self.schedule = schedule.map(str::to_string);
        self
    }

    pub fn execute_immediately(mut self, execute_immediately: bool) -> Self {
        self.execute_immediately = execute_immediately;
        self
    }
}

/// Creates, runs, rewinds and removes pipelines on behalf of callers.
pub struct PipelineManager<S, J> {
    store: S,
    scheduler: J,
    config: EngineConfig,
    principal: ServicePrincipal,
}

impl<S, J> PipelineManager<S, J>
where
    S: PipelineStore,
    J: Scheduler,
{
    pub fn new(store: S, scheduler: J, config: EngineConfig) -> Self {
        let principal = ServicePrincipal {
            role: config.service_role.clone(),
        };

        Self {
            store,
            scheduler,
            config,
            principal,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn scheduler(&self) -> &J {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn executor(&self) -> Executor<'_, S> {
        Executor::new(&self.store, &self.principal, &self.config)
    }

    pub async fn create_sequence_pipeline(
        &self,
        caller: &Caller,
        request: NewSequencePipeline,
    ) -> Result<(), PipelineError> {
        validate_name(&request.name)?;
        validate_schedule(request.schedule.as_deref())?;

        let mut txn = self.store.begin(&self.principal).await?;
        let source = txn
            .describe_source(&request.counter)
            .await?
            .ok_or_else(|| missing_relation(&request.counter))?;
        let (counter, relation) = sequence_source(source)?;
        txn.validate_command(&request.command, ParamShape::BigintRange)
            .await?;

        let pipeline = Pipeline {
            name: request.name,
            kind: PipelineKind::Sequence,
            owner: caller.role.clone(),
            source: Some(counter.clone()),
            command: request.command,
        };
        let state = PipelineState::Sequence(SequenceState {
            counter,
            relation,
            last_processed: None,
        });
        self.insert(txn, &pipeline, &state).await?;

        self.finish_create(
            caller,
            &pipeline,
            request.schedule.as_deref(),
            request.execute_immediately,
        )
        .await
    }

    pub async fn create_time_interval_pipeline(
        &self,
        caller: &Caller,
        request: NewTimeIntervalPipeline,
    ) -> Result<(), PipelineError> {
        validate_name(&request.name)?;
        validate_schedule(request.schedule.as_deref())?;
        if request.interval <= Duration::zero() || request.interval.num_microseconds().is_none() {
            return Err(PipelineError::invalid("interval must be a positive duration"));
        }
        if request.min_delay < Duration::zero() || request.min_delay.num_microseconds().is_none() {
            return Err(PipelineError::invalid("min_delay cannot be negative"));
        }
        if !request.batched && request.start_time.is_none() {
            return Err(PipelineError::invalid(
                "start_time is required for non-batched pipelines, which are executed for every interval starting from the start_time",
            ));
        }

        let mut txn = self.store.begin(&self.principal).await?;
        let source = match &request.source {
            Some(reference) => {
                let object = txn
                    .describe_source(reference)
                    .await?
                    .ok_or_else(|| missing_relation(reference))?;
                Some(object.name().to_string())
            }
            None => None,
        };
        txn.validate_command(&request.command, ParamShape::TimestampRange)
            .await?;

        let pipeline = Pipeline {
            name: request.name,
            kind: PipelineKind::TimeInterval,
            owner: caller.role.clone(),
            source,
            command: request.command,
        };
        let state = PipelineState::TimeInterval(TimeIntervalState {
            interval: request.interval,
            anchor: request.start_time.unwrap_or_else(default_anchor),
            min_delay: request.min_delay,
            batched: request.batched,
            last_processed: None,
        });
        self.insert(txn, &pipeline, &state).await?;

        self.finish_create(
            caller,
            &pipeline,
            request.schedule.as_deref(),
            request.execute_immediately,
        )
        .await
    }

    pub async fn create_file_list_pipeline(
        &self,
        caller: &Caller,
        request: NewFileListPipeline,
    ) -> Result<(), PipelineError> {
        validate_name(&request.name)?;
        validate_schedule(request.schedule.as_deref())?;

        let requested = request
            .list_function
            .unwrap_or_else(|| self.config.default_list_function.clone());

        let mut txn = self.store.begin(&self.principal).await?;
        let list_function = txn
            .resolve_list_function(&requested)
            .await?
            .ok_or_else(|| {
                PipelineError::invalid(format!("function {requested}(text) does not exist"))
            })?;
        let shape = PipelineKind::FileList.param_shape(request.batched);
        txn.validate_command(&request.command, shape).await?;

        let pipeline = Pipeline {
            name: request.name,
            kind: PipelineKind::FileList,
            owner: caller.role.clone(),
            source: None,
            command: request.command,
        };
        let state = PipelineState::FileList(FileListState {
            pattern: request.pattern,
            batched: request.batched,
            list_function,
            max_batch_size: request.max_batch_size,
        });
        self.insert(txn, &pipeline, &state).await?;

        self.finish_create(
            caller,
            &pipeline,
            request.schedule.as_deref(),
            request.execute_immediately,
        )
        .await
    }

    pub async fn execute_pipeline(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let pipeline = self.authorized_pipeline(caller, name).await?;
        self.executor().execute(caller, &pipeline).await
    }

    pub async fn reset_pipeline(&self, caller: &Caller, name: &str) -> Result<(), PipelineError> {
        let pipeline = self.authorized_pipeline(caller, name).await?;

        let mut txn = self.store.begin(&self.principal).await?;
        match txn.lock_state(&pipeline).await? {
            PipelineState::Sequence(_) => txn.set_sequence_watermark(name, None).await?,
            PipelineState::TimeInterval(_) => txn.set_time_interval_watermark(name, None).await?,
            PipelineState::FileList(_) => {
                let cleared = txn.clear_processed_files(name).await?;
                info!("pipeline {}: forgot {} processed files", name, cleared);
            }
        }
        txn.commit().await?;

        info!("pipeline {}: reset", name);
        Ok(())
    }

    pub async fn drop_pipeline(&self, caller: &Caller, name: &str) -> Result<(), PipelineError> {
        let pipeline = self.authorized_pipeline(caller, name).await?;

        let mut txn = self.store.begin(&self.principal).await?;
        // Waits for a running execution to finish first
        txn.lock_state(&pipeline).await?;
        txn.delete_pipeline(name).await?;
        txn.commit().await?;

        self.scheduler.unschedule(&job_name_for(name)).await?;
        info!("pipeline {}: dropped", name);
        Ok(())
    }

    pub async fn describe_pipeline(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<PipelineDescription, PipelineError> {
        let pipeline = self.authorized_pipeline(caller, name).await?;

        let mut txn = self.store.begin(&self.principal).await?;
        let state = txn.get_state(&pipeline).await?;
        txn.rollback().await?;

        Ok(PipelineDescription { pipeline, state })
    }

    /// Removes every pipeline reading from a source object that no longer exists. Called by
    /// whatever observes the drop, so no caller authorization applies.
    pub async fn delete_pipelines_by_source(
        &self,
        object: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let mut txn = self.store.begin(&self.principal).await?;
        let names = txn.pipelines_by_source(object).await?;
        for name in &names {
            txn.delete_pipeline(name).await?;
        }
        txn.commit().await?;

        for name in &names {
            self.scheduler.unschedule(&job_name_for(name)).await?;
            info!("pipeline {}: dropped because {} was dropped", name, object);
        }

        Ok(names)
    }

    async fn authorized_pipeline(
        &self,
        caller: &Caller,
        name: &str,
    ) -> Result<Pipeline, PipelineError> {
        let mut txn = self.store.begin(&self.principal).await?;
        let pipeline = txn
            .get_pipeline(name)
            .await?
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
        txn.rollback().await?;

        if !caller.can_manage(&pipeline) {
            return Err(PipelineError::PermissionDenied(format!("pipeline {name}")));
        }

        Ok(pipeline)
    }

    async fn insert(
        &self,
        mut txn: S::Transaction,
        pipeline: &Pipeline,
        state: &PipelineState,
    ) -> Result<(), PipelineError> {
        txn.insert_pipeline(pipeline).await?;
        txn.insert_state(&pipeline.name, state).await?;
        txn.commit().await?;

        info!("pipeline {}: created {} pipeline", pipeline.name, pipeline.kind);
        Ok(())
    }

    // The definition is committed by now. A failed schedule takes it away again, a failed
    // first execution leaves it in place for the scheduler to retry.
    async fn finish_create(
        &self,
        caller: &Caller,
        pipeline: &Pipeline,
        schedule: Option<&str>,
        execute_immediately: bool,
    ) -> Result<(), PipelineError> {
        if let Some(schedule) = schedule {
            let job = JobSpec::for_pipeline(&pipeline.name, schedule, &pipeline.owner);
            match self.scheduler.schedule(&job).await {
                Ok(job_id) => info!(
                    "pipeline {}: scheduled cron job with ID {} and schedule {}",
                    pipeline.name, job_id, schedule
                ),
                Err(e) => {
                    self.discard(pipeline).await;
                    return Err(e);
                }
            }
        }

        if execute_immediately {
            self.executor().execute(caller, pipeline).await?;
        }

        Ok(())
    }

    async fn discard(&self, pipeline: &Pipeline) {
        let result = async {
            let mut txn = self.store.begin(&self.principal).await?;
            txn.delete_pipeline(&pipeline.name).await?;
            txn.commit().await
        }
        .await;

        if let Err(e) = result {
            warn!(
                "pipeline {}: failed to remove after unsuccessful creation: {}",
                pipeline.name, e
            );
        }
    }
}

fn validate_name(name: &str) -> Result<(), PipelineError> {
    if name.trim().is_empty() {
        return Err(PipelineError::invalid("pipeline_name cannot be empty"));
    }
    Ok(())
}

fn validate_schedule(schedule: Option<&str>) -> Result<(), PipelineError> {
    if let Some(schedule) = schedule {
        parse_schedule(schedule)?;
    }
    Ok(())
}

fn missing_relation(reference: &str) -> PipelineError {
    PipelineError::invalid(format!("relation \"{reference}\" does not exist"))
}

// Returns the counter and the table whose writers produce its values
fn sequence_source(source: SourceObject) -> Result<(String, String), PipelineError> {
    match source {
        SourceObject::Sequence {
            name,
            owned_by: Some(table),
        } => Ok((name, table)),
        SourceObject::Sequence { owned_by: None, .. } => Err(PipelineError::invalid(
            "only sequences that are owned by a table are supported",
        )),
        SourceObject::Table {
            name,
            mut owned_sequences,
        } => match owned_sequences.len() {
            0 => Err(PipelineError::invalid(format!(
                "relation \"{name}\" does not have any sequences associated with it; specify the name of the sequence to use for the pipeline"
            ))),
            1 => Ok((owned_sequences.remove(0), name)),
            _ => Err(PipelineError::invalid(format!(
                "relation \"{name}\" has multiple sequences associated with it; specify the name of the sequence to use for the pipeline"
            ))),
        },
        SourceObject::Other { name, kind } => Err(PipelineError::invalid(format!(
            "{name} is not a table or sequence ({kind})"
        ))),
    }
}
