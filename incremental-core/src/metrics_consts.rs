pub const EXECUTIONS_STARTED: &str = "incremental_pipeline_executions_started";
pub const EXECUTIONS_PROCESSED: &str = "incremental_pipeline_executions_processed";
pub const EXECUTIONS_NOOP: &str = "incremental_pipeline_executions_noop";
pub const EXECUTIONS_FAILED: &str = "incremental_pipeline_executions_failed";

// Ranges, windows and file batches handed to commands
pub const UNITS_PROCESSED: &str = "incremental_pipeline_units_processed";
pub const FILES_PROCESSED: &str = "incremental_pipeline_files_processed";
pub const COMMAND_TIME: &str = "incremental_pipeline_command_seconds";
