use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::PgPool;
use tracing::warn;

use crate::error::PipelineError;
use crate::ops::jobs;

pub use crate::ops::jobs::ScheduledJobRow as ScheduledJob;

const DAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Name of the periodic job that executes `pipeline`.
pub fn job_name_for(pipeline: &str) -> String {
    format!("pipeline:{pipeline}")
}

/// A request to run a pipeline periodically on behalf of its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job_name: String,
    pub schedule: String,
    pub pipeline_name: String,
    pub owner: String,
}

impl JobSpec {
    pub fn for_pipeline(pipeline: &str, schedule: &str, owner: &str) -> Self {
        Self {
            job_name: job_name_for(pipeline),
            schedule: schedule.to_string(),
            pipeline_name: pipeline.to_string(),
            owner: owner.to_string(),
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Creates or replaces the job, returning its id.
    async fn schedule(&self, job: &JobSpec) -> Result<i64, PipelineError>;
    /// Returns false when no job with that name existed.
    async fn unschedule(&self, job_name: &str) -> Result<bool, PipelineError>;
}

/// Parses a schedule in any of the accepted notations.
///
/// Accepts classic five-field cron (minute granularity, 0 or 7 is Sunday), six or seven field
/// cron with seconds, `@hourly`-style shorthands and `N seconds` for N between 1 and 59.
pub fn parse_schedule(expression: &str) -> Result<Schedule, PipelineError> {
    let normalized = normalize_schedule(expression)?;
    Schedule::from_str(&normalized).map_err(|e| {
        PipelineError::invalid(format!("invalid schedule \"{expression}\": {e}"))
    })
}

fn normalize_schedule(expression: &str) -> Result<String, PipelineError> {
    let expression = expression.trim();
    let invalid = || PipelineError::invalid(format!("invalid schedule \"{expression}\""));

    if let Some(seconds) = expression
        .strip_suffix("seconds")
        .or_else(|| expression.strip_suffix("second"))
    {
        let seconds: u32 = seconds.trim().parse().map_err(|_| invalid())?;
        if !(1..=59).contains(&seconds) {
            return Err(invalid());
        }
        return Ok(format!("*/{seconds} * * * * *"));
    }

    if expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = weekday_names(fields[4]).ok_or_else(invalid)?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekday
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        _ => Err(invalid()),
    }
}

// Five-field cron counts weekdays from Sunday = 0, the parser from Sunday = 1, so numeric
// weekdays are rewritten to names which both agree on
fn weekday_names(field: &str) -> Option<String> {
    let parts: Option<Vec<String>> = field.split(',').map(weekday_part).collect();
    parts.map(|parts| parts.join(","))
}

fn weekday_part(part: &str) -> Option<String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };

    // 7 is Sunday again, which the parser only knows as the start of the week
    if let Some((start, "7")) = range.split_once('-') {
        if let Ok(start) = start.parse::<usize>() {
            return wrapping_weekdays(start, step);
        }
    }

    let range: Option<Vec<String>> = range
        .split('-')
        .map(|bound| match bound.parse::<usize>() {
            Ok(day) => DAY_NAMES.get(day).map(|name| name.to_string()),
            Err(_) => Some(bound.to_string()),
        })
        .collect();
    let range = range?.join("-");
    Some(match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    })
}

// A range ending on 7, spelled as days the parser accepts
fn wrapping_weekdays(start: usize, step: Option<&str>) -> Option<String> {
    let first = DAY_NAMES.get(start)?;
    match step {
        None if start == 7 => Some("SUN".to_string()),
        None => Some(format!("{first}-SAT,SUN")),
        Some(step) => {
            let step: usize = step.parse().ok().filter(|step| *step > 0)?;
            let days: Vec<&str> = (start..=7)
                .step_by(step)
                .filter_map(|day| DAY_NAMES.get(day).copied())
                .collect();
            Some(days.join(","))
        }
    }
}

/// The first time the schedule fires strictly after `after`.
pub fn next_run_after(
    schedule: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, PipelineError> {
    Ok(parse_schedule(schedule)?.after(&after).next())
}

/// Whether a job last run at `last_run` (or created at `created_at`) is due at `now`.
pub fn is_due(job: &ScheduledJob, now: DateTime<Utc>) -> Result<bool, PipelineError> {
    let since = job.last_run_at.unwrap_or(job.created_at);
    Ok(next_run_after(&job.schedule, since)?.is_some_and(|next| next <= now))
}

/// Keeps jobs in the `incremental.scheduled_jobs` table, where the runner picks them up.
#[derive(Clone)]
pub struct PgScheduler {
    pool: PgPool,
}

impl PgScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn jobs(&self) -> Result<Vec<ScheduledJob>, PipelineError> {
        jobs::list_jobs(&self.pool).await
    }

    /// Returns the jobs due at `now` that this caller won the right to run.
    pub async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, PipelineError> {
        let mut claimed = Vec::new();
        for job in self.jobs().await? {
            match is_due(&job, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(job = %job.job_name, "skipping job with unusable schedule: {}", e);
                    continue;
                }
            }
            if jobs::claim_job_run(&self.pool, job.job_id, job.last_run_at, now).await? {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl Scheduler for PgScheduler {
    async fn schedule(&self, job: &JobSpec) -> Result<i64, PipelineError> {
        jobs::upsert_job(
            &self.pool,
            &job.job_name,
            &job.schedule,
            &job.pipeline_name,
            &job.owner,
        )
        .await
    }

    async fn unschedule(&self, job_name: &str) -> Result<bool, PipelineError> {
        jobs::delete_job(&self.pool, job_name).await
    }
}

/// Keeps jobs in memory, for embedding and tests.
#[derive(Default)]
pub struct MemoryScheduler {
    jobs: Mutex<BTreeMap<String, (i64, JobSpec)>>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(i64, JobSpec)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn job(&self, job_name: &str) -> Option<JobSpec> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_name)
            .map(|(_, job)| job.clone())
    }

    // While set, scheduling fails as if the scheduler could not be reached
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn schedule(&self, job: &JobSpec) -> Result<i64, PipelineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::SchedulerError(
                "scheduler is unavailable".to_string(),
            ));
        }

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let id = match jobs.get(&job.job_name) {
            Some((id, _)) => *id,
            None => self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        jobs.insert(job.job_name.clone(), (id, job.clone()));
        Ok(id)
    }

    async fn unschedule(&self, job_name: &str) -> Result<bool, PipelineError> {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_name);
        Ok(removed.is_some())
    }
}
