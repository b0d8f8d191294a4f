pub const RUN_STARTS: &str = "incremental_runner_run_starts";
pub const RUN_TIME: &str = "incremental_runner_total_run_ms";
pub const RUN_ENDS: &str = "incremental_runner_run_ends";
pub const RUN_ERRORS: &str = "incremental_runner_run_errors";

pub const JOBS_CLAIMED: &str = "incremental_runner_jobs_claimed";
pub const JOBS_PROCESSED: &str = "incremental_runner_jobs_processed";
pub const JOBS_NOOP: &str = "incremental_runner_jobs_noop";
pub const JOBS_FAILED: &str = "incremental_runner_jobs_failed";
pub const JOB_TIME: &str = "incremental_runner_job_ms";

pub const PIPELINES_DROPPED: &str = "incremental_runner_pipelines_dropped";
