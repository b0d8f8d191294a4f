use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use incremental_core::{
    Caller, ExecutionOutcome, PgPipelineStore, PgScheduler, PipelineError, PipelineManager,
    PipelineStore, ScheduledJob, Scheduler,
};
use tracing::{info, warn};

use crate::config::RunnerSettings;
use crate::metrics::{inc, timing_guard};
use crate::metrics_constants::*;

pub type PgPipelineManager = PipelineManager<PgPipelineStore, PgScheduler>;

// Mostly for tests, the metrics carry the same numbers
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RunResult {
    pub claimed: u64,
    pub processed: u64,
    pub noop: u64,
    pub failed: u64,
}

/// Executes the jobs of one tick, at most `max_concurrent` at a time. Each job runs as the
/// pipeline owner it was scheduled for, and a failing job does not affect the others.
pub async fn execute_jobs<S, J>(
    manager: &PipelineManager<S, J>,
    jobs: Vec<ScheduledJob>,
    max_concurrent: usize,
    metrics_labels: &[(String, String)],
) -> RunResult
where
    S: PipelineStore,
    J: Scheduler,
{
    let mut result = RunResult {
        claimed: jobs.len() as u64,
        ..Default::default()
    };

    let mut outcomes = stream::iter(jobs)
        .map(|job| async move {
            let _time = timing_guard(JOB_TIME, metrics_labels);
            let caller = Caller::new(job.owner_role.clone());
            let outcome = manager.execute_pipeline(&caller, &job.pipeline_name).await;
            (job, outcome)
        })
        .buffer_unordered(max_concurrent.max(1));

    while let Some((job, outcome)) = outcomes.next().await {
        match outcome {
            Ok(ExecutionOutcome::NoOp) => result.noop += 1,
            Ok(ExecutionOutcome::Processed(units)) => {
                info!(
                    job = %job.job_name,
                    "pipeline {} processed {} units",
                    job.pipeline_name,
                    units.len()
                );
                result.processed += 1;
            }
            Err(PipelineError::NotFound(_)) => {
                // The pipeline went away but its job did not, likely a crash between the two
                warn!(job = %job.job_name, "job refers to missing pipeline {}", job.pipeline_name);
                result.failed += 1;
            }
            Err(e) => {
                warn!(job = %job.job_name, "pipeline {} failed: {}", job.pipeline_name, e);
                result.failed += 1;
            }
        }
    }

    inc(JOBS_CLAIMED, metrics_labels, result.claimed);
    inc(JOBS_PROCESSED, metrics_labels, result.processed);
    inc(JOBS_NOOP, metrics_labels, result.noop);
    inc(JOBS_FAILED, metrics_labels, result.failed);

    result
}

pub struct Runner {
    pub manager: PgPipelineManager,
    pub settings: RunnerSettings,
    pub metrics_labels: Vec<(String, String)>,
}

impl Runner {
    pub fn new(manager: PgPipelineManager, settings: RunnerSettings) -> Self {
        let metrics_labels = vec![("runner_id".to_string(), settings.id.clone())];

        Self {
            manager,
            settings,
            metrics_labels,
        }
    }

    pub async fn run_migrations(&self) -> Result<(), PipelineError> {
        self.manager.store().run_migrations().await
    }

    /// Claims the jobs due at `now` and runs them. Claims are taken per job, so runners sharing
    /// a database never run the same firing twice.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunResult, PipelineError> {
        let _loop_start = timing_guard(RUN_TIME, &self.metrics_labels);
        inc(RUN_STARTS, &self.metrics_labels, 1);

        let jobs = self.manager.scheduler().claim_due_jobs(now).await?;
        if !jobs.is_empty() {
            info!("claimed {} due jobs", jobs.len());
        }

        let result = execute_jobs(
            &self.manager,
            jobs,
            self.settings.max_concurrent_jobs,
            &self.metrics_labels,
        )
        .await;

        inc(RUN_ENDS, &self.metrics_labels, 1);
        Ok(result)
    }
}
