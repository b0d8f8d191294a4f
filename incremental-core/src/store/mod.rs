use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::types::{
    Caller, CommandParams, CounterPosition, ParamShape, Pipeline, PipelineState,
    ServicePrincipal, SourceObject,
};

pub mod memory;
pub mod pg;

/// Opens units of work against the storage substrate.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    type Transaction: PipelineTransaction;

    /// Starts a transaction whose internal reads and writes run as `principal`.
    async fn begin(
        &self,
        principal: &ServicePrincipal,
    ) -> Result<Self::Transaction, PipelineError>;
}

/// A single atomic unit of work. Everything written through it, including the effects of
/// the user command, becomes visible together on `commit`. Dropping it without committing
/// discards every write and releases every lock it took.
#[async_trait]
pub trait PipelineTransaction: Send + Sized {
    // Registry
    async fn insert_pipeline(&mut self, pipeline: &Pipeline) -> Result<(), PipelineError>;
    async fn get_pipeline(&mut self, name: &str) -> Result<Option<Pipeline>, PipelineError>;
    async fn delete_pipeline(&mut self, name: &str) -> Result<bool, PipelineError>;
    // Names of pipelines reading from `object`, either as source relation or as counter
    async fn pipelines_by_source(&mut self, object: &str) -> Result<Vec<String>, PipelineError>;

    // Catalog
    async fn describe_source(
        &mut self,
        reference: &str,
    ) -> Result<Option<SourceObject>, PipelineError>;
    // Canonical name of a listing function taking a single text argument, if it exists
    async fn resolve_list_function(&mut self, name: &str)
        -> Result<Option<String>, PipelineError>;
    async fn validate_command(
        &mut self,
        command: &str,
        shape: ParamShape,
    ) -> Result<(), PipelineError>;
    async fn has_counter_access(
        &mut self,
        caller: &Caller,
        counter: &str,
    ) -> Result<bool, PipelineError>;

    // Watermarks and ledger
    async fn insert_state(
        &mut self,
        pipeline: &str,
        state: &PipelineState,
    ) -> Result<(), PipelineError>;
    async fn get_state(&mut self, pipeline: &Pipeline) -> Result<PipelineState, PipelineError>;
    // Like get_state, but holds an exclusive lock on the row until the transaction ends
    async fn lock_state(&mut self, pipeline: &Pipeline) -> Result<PipelineState, PipelineError>;
    async fn set_sequence_watermark(
        &mut self,
        pipeline: &str,
        last_processed: Option<i64>,
    ) -> Result<(), PipelineError>;
    async fn set_time_interval_watermark(
        &mut self,
        pipeline: &str,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<(), PipelineError>;
    async fn processed_files(&mut self, pipeline: &str) -> Result<HashSet<String>, PipelineError>;
    async fn record_processed_files(
        &mut self,
        pipeline: &str,
        paths: &[String],
    ) -> Result<(), PipelineError>;
    async fn clear_processed_files(&mut self, pipeline: &str) -> Result<u64, PipelineError>;

    // Sources
    async fn counter_position(&mut self, counter: &str) -> Result<CounterPosition, PipelineError>;
    // Blocks until every writer that was in flight on `relation` has finished
    async fn wait_for_writers(
        &mut self,
        relation: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError>;
    async fn now(&mut self) -> Result<DateTime<Utc>, PipelineError>;
    async fn list_files(
        &mut self,
        caller: &Caller,
        function: &str,
        pattern: &str,
    ) -> Result<Vec<String>, PipelineError>;

    /// Runs the pipeline's command as `caller`. Failures of the command itself come back as
    /// `PipelineError::CommandFailed`, after which the transaction can only be rolled back.
    async fn run_command(
        &mut self,
        pipeline: &Pipeline,
        caller: &Caller,
        params: &CommandParams,
    ) -> Result<(), PipelineError>;

    async fn commit(self) -> Result<(), PipelineError>;
    async fn rollback(self) -> Result<(), PipelineError>;
}
