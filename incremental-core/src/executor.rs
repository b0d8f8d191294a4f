use std::time::Instant;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::metrics_consts::*;
use crate::resolve::{file_list, sequence, time_interval};
use crate::store::{PipelineStore, PipelineTransaction};
use crate::types::{
    Caller, CommandParams, ExecutionOutcome, Pipeline, PipelineKind, PipelineState,
    ProcessedUnit, ServicePrincipal,
};

/// Runs one invocation of a pipeline: resolve the next unit of work under the pipeline's row
/// lock, hand it to the command, and advance the watermark or ledger in the same transaction.
pub struct Executor<'a, S> {
    store: &'a S,
    principal: &'a ServicePrincipal,
    config: &'a EngineConfig,
}

impl<'a, S: PipelineStore> Executor<'a, S> {
    pub fn new(store: &'a S, principal: &'a ServicePrincipal, config: &'a EngineConfig) -> Self {
        Self {
            store,
            principal,
            config,
        }
    }

    pub async fn execute(
        &self,
        caller: &Caller,
        pipeline: &Pipeline,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let kind = pipeline.kind.as_str();
        metrics::counter!(EXECUTIONS_STARTED, "pipeline_kind" => kind).increment(1);

        let result = match pipeline.kind {
            PipelineKind::Sequence => self.execute_sequence(caller, pipeline).await,
            PipelineKind::TimeInterval => {
                self.execute_time_interval(caller, pipeline).await
            }
            PipelineKind::FileList => self.execute_file_list(caller, pipeline).await,
        };

        match &result {
            Ok(ExecutionOutcome::NoOp) => {
                metrics::counter!(EXECUTIONS_NOOP, "pipeline_kind" => kind).increment(1);
            }
            Ok(ExecutionOutcome::Processed(units)) => {
                metrics::counter!(EXECUTIONS_PROCESSED, "pipeline_kind" => kind).increment(1);
                metrics::counter!(UNITS_PROCESSED, "pipeline_kind" => kind)
                    .increment(units.len() as u64);
            }
            Err(e) => {
                warn!(pipeline = %pipeline.name, "pipeline execution failed: {}", e);
                metrics::counter!(EXECUTIONS_FAILED, "pipeline_kind" => kind).increment(1);
            }
        }

        result
    }

    async fn run_command(
        &self,
        txn: &mut S::Transaction,
        caller: &Caller,
        pipeline: &Pipeline,
        params: &CommandParams,
    ) -> Result<(), PipelineError> {
        let start = Instant::now();
        let result = txn.run_command(pipeline, caller, params).await;
        metrics::histogram!(COMMAND_TIME, "pipeline_kind" => pipeline.kind.as_str())
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_sequence(
        &self,
        caller: &Caller,
        pipeline: &Pipeline,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let mut txn = self.store.begin(self.principal).await?;
        let PipelineState::Sequence(state) = txn.lock_state(pipeline).await? else {
            return Err(state_mismatch(pipeline));
        };

        if !caller.privileged && !txn.has_counter_access(caller, &state.counter).await? {
            return Err(PipelineError::PermissionDenied(format!(
                "sequence {}",
                state.counter
            )));
        }

        let position = txn.counter_position(&state.counter).await?;
        let Some(range) = sequence::resolve_range(state.last_processed, &position) else {
            info!("pipeline {}: no rows to process", pipeline.name);
            txn.rollback().await?;
            return Ok(ExecutionOutcome::NoOp);
        };

        // Values up to range.end may have been drawn by writers that have not committed yet
        txn.wait_for_writers(&state.relation, self.config.writer_wait_timeout)
            .await?;

        info!(
            "pipeline {}: processing sequence values from {} to {}",
            pipeline.name, range.start, range.end
        );
        self.run_command(
            &mut txn,
            caller,
            pipeline,
            &CommandParams::Range(range.start, range.end),
        )
        .await?;
        txn.set_sequence_watermark(&pipeline.name, Some(range.end))
            .await?;
        txn.commit().await?;

        Ok(ExecutionOutcome::Processed(vec![ProcessedUnit::Range(range)]))
    }

    async fn execute_time_interval(
        &self,
        caller: &Caller,
        pipeline: &Pipeline,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let mut units = Vec::new();
        // Fixed at the first resolution, so a backlog drains without chasing the clock
        let mut horizon = None;

        loop {
            let mut txn = self.store.begin(self.principal).await?;
            let PipelineState::TimeInterval(state) = txn.lock_state(pipeline).await? else {
                return Err(state_mismatch(pipeline));
            };

            let now = match horizon {
                Some(now) => now,
                None => {
                    let now = txn.now().await?;
                    horizon = Some(now);
                    now
                }
            };

            if units.is_empty() && !state.batched {
                let pending = time_interval::eligible_window_count(&state, now);
                if pending > 1 {
                    info!(
                        "pipeline {}: processing {} intervals starting at {}",
                        pipeline.name,
                        pending,
                        time_interval::next_boundary(&state)
                    );
                }
            }

            let Some(window) = time_interval::resolve_window(&state, now) else {
                txn.rollback().await?;
                break;
            };

            if let Some(source) = &pipeline.source {
                txn.wait_for_writers(source, self.config.writer_wait_timeout)
                    .await?;
            }

            info!(
                "pipeline {}: processing time range from {} to {}",
                pipeline.name, window.start, window.end
            );
            self.run_command(
                &mut txn,
                caller,
                pipeline,
                &CommandParams::TimeRange(window.start, window.end),
            )
            .await?;
            txn.set_time_interval_watermark(&pipeline.name, Some(window.end))
                .await?;
            txn.commit().await?;
            units.push(ProcessedUnit::Window(window));

            if state.batched {
                break;
            }
        }

        if units.is_empty() {
            info!("pipeline {}: no rows to process", pipeline.name);
            return Ok(ExecutionOutcome::NoOp);
        }

        Ok(ExecutionOutcome::Processed(units))
    }

    async fn execute_file_list(
        &self,
        caller: &Caller,
        pipeline: &Pipeline,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let (state, pending) = {
            let mut txn = self.store.begin(self.principal).await?;
            let PipelineState::FileList(state) = txn.lock_state(pipeline).await? else {
                return Err(state_mismatch(pipeline));
            };
            let listing = txn
                .list_files(caller, &state.list_function, &state.pattern)
                .await?;
            let processed = txn.processed_files(&pipeline.name).await?;
            txn.rollback().await?;

            (state, file_list::unprocessed_files(listing, &processed))
        };

        if pending.is_empty() {
            info!("pipeline {}: no files to process", pipeline.name);
            return Ok(ExecutionOutcome::NoOp);
        }

        let batches = file_list::plan_batches(pending, state.batched, state.max_batch_size);
        let mut units = Vec::with_capacity(batches.len());

        for batch in batches {
            let mut txn = self.store.begin(self.principal).await?;
            txn.lock_state(pipeline).await?;

            // Another invocation may have taken some of these between resolution and now
            let processed = txn.processed_files(&pipeline.name).await?;
            let batch: Vec<String> = batch
                .into_iter()
                .filter(|path| !processed.contains(path))
                .collect();

            let params = match batch.as_slice() {
                [] => {
                    txn.rollback().await?;
                    continue;
                }
                [path] if !state.batched => {
                    info!(
                        "pipeline {}: processing file list pipeline for {}",
                        pipeline.name, path
                    );
                    CommandParams::File(path.clone())
                }
                paths => {
                    info!(
                        "pipeline {}: processing file list pipeline for {} files",
                        pipeline.name,
                        paths.len()
                    );
                    CommandParams::Files(paths.to_vec())
                }
            };

            self.run_command(&mut txn, caller, pipeline, &params).await?;
            txn.record_processed_files(&pipeline.name, &batch).await?;
            txn.commit().await?;

            metrics::counter!(FILES_PROCESSED, "pipeline_kind" => pipeline.kind.as_str())
                .increment(batch.len() as u64);
            units.push(ProcessedUnit::Files(batch));
        }

        if units.is_empty() {
            info!("pipeline {}: no files to process", pipeline.name);
            return Ok(ExecutionOutcome::NoOp);
        }

        Ok(ExecutionOutcome::Processed(units))
    }
}

fn state_mismatch(pipeline: &Pipeline) -> PipelineError {
    PipelineError::invalid(format!(
        "pipeline {} is registered as {} but its state does not match",
        pipeline.name, pipeline.kind
    ))
}
