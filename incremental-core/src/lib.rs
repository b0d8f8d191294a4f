// Modules are private and re-exported piecemeal, so internals can move around without breaking
// the public API
mod ops;

// Types
mod types;
pub use types::default_anchor;
pub use types::Caller;
pub use types::CommandParams;
pub use types::CounterPosition;
pub use types::ExecutionOutcome;
pub use types::FileListState;
pub use types::ParamShape;
pub use types::Pipeline;
pub use types::PipelineDescription;
pub use types::PipelineKind;
pub use types::PipelineState;
pub use types::ProcessedUnit;
pub use types::SequenceRange;
pub use types::SequenceState;
pub use types::ServicePrincipal;
pub use types::SourceObject;
pub use types::TimeIntervalState;
pub use types::TimeWindow;

// Errors
mod error;
// Failures of the user command itself, wrapped into PipelineError::CommandFailed
pub use error::CommandError;
pub use error::PipelineError;

// Safe-range computation for each pipeline kind
pub mod resolve;

// Storage
mod store;
pub use store::memory::{CommandInvocation, MemoryPipelineStore, MemoryTransaction, WriterGuard};
pub use store::pg::{PgPipelineStore, PgPipelineTransaction};
pub use store::{PipelineStore, PipelineTransaction};

// Execution
mod executor;
pub use executor::Executor;

// Lifecycle
mod manager;
pub use manager::NewFileListPipeline;
pub use manager::NewSequencePipeline;
pub use manager::NewTimeIntervalPipeline;
pub use manager::PipelineManager;
pub use manager::DEFAULT_MIN_DELAY_SECONDS;
pub use manager::DEFAULT_SCHEDULE;

// Scheduling
mod schedule;
pub use schedule::is_due;
pub use schedule::job_name_for;
pub use schedule::next_run_after;
pub use schedule::parse_schedule;
pub use schedule::JobSpec;
pub use schedule::MemoryScheduler;
pub use schedule::PgScheduler;
pub use schedule::ScheduledJob;
pub use schedule::Scheduler;

// Config
mod config;
pub use config::EngineConfig;
pub use config::PoolConfig;
pub use config::DEFAULT_LIST_FUNCTION;
pub use config::DEFAULT_WRITER_WAIT_TIMEOUT;

mod metrics_consts;

// Channel the drop event trigger notifies with the name of each pipeline it removed
pub const SOURCE_DROPPED_CHANNEL: &str = "incremental_source_dropped";

pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), PipelineError> {
    ops::meta::run_migrations(pool).await
}
