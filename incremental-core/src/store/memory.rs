use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

use crate::error::{CommandError, PipelineError};
use crate::store::{PipelineStore, PipelineTransaction};
use crate::types::{
    Caller, CommandParams, CounterPosition, ParamShape, Pipeline, PipelineState,
    ServicePrincipal, SourceObject,
};

pub type ListFunction = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;
pub type CommandHandler =
    Arc<dyn Fn(&CommandInvocation) -> Result<(), CommandError> + Send + Sync>;

/// A single call of a pipeline command, as seen by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub pipeline: String,
    pub role: String,
    pub command: String,
    pub params: CommandParams,
}

#[derive(Debug, Clone)]
enum Relation {
    Table,
    ForeignTable,
    View,
    Sequence {
        owned_by: Option<String>,
        origin: i64,
        last_value: Option<i64>,
        grants: HashSet<String>,
    },
}

#[derive(Default)]
struct Catalog {
    pipelines: BTreeMap<String, Pipeline>,
    states: HashMap<String, PipelineState>,
    ledger: HashMap<String, BTreeSet<String>>,
    relations: BTreeMap<String, Relation>,
    writers: HashMap<String, usize>,
    list_functions: HashMap<String, ListFunction>,
    command_handler: Option<CommandHandler>,
    attempts: Vec<CommandInvocation>,
    committed: Vec<CommandInvocation>,
    clock: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Shared {
    catalog: Mutex<Catalog>,
    row_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    writers_changed: Notify,
}

impl Shared {
    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, pipeline: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(pipeline.to_string()).or_default().clone()
    }

    // Forgets locks nobody holds or waits for any more
    fn release_row_locks(&self, pipelines: impl IntoIterator<Item = String>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for pipeline in pipelines {
            if locks
                .get(&pipeline)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&pipeline);
            }
        }
    }

    fn active_writers(&self, relation: &str) -> usize {
        self.catalog().writers.get(relation).copied().unwrap_or(0)
    }
}

/// An in-process store with the same transactional contract as the PostgreSQL one.
///
/// Writes are staged inside a transaction and applied together on commit, reads see
/// committed data, and `lock_state` serialises transactions on the same pipeline. Relations,
/// counters, in-flight writers, listing functions and the command itself are simulated
/// through the registration methods, which makes this store the basis of the engine's tests.
#[derive(Clone, Default)]
pub struct MemoryPipelineStore {
    shared: Arc<Shared>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&self, name: &str) {
        self.shared
            .catalog()
            .relations
            .insert(name.to_string(), Relation::Table);
    }

    pub fn register_foreign_table(&self, name: &str) {
        self.shared
            .catalog()
            .relations
            .insert(name.to_string(), Relation::ForeignTable);
    }

    pub fn register_view(&self, name: &str) {
        self.shared
            .catalog()
            .relations
            .insert(name.to_string(), Relation::View);
    }

    pub fn register_sequence(&self, name: &str, owned_by: Option<&str>, origin: i64) {
        self.shared.catalog().relations.insert(
            name.to_string(),
            Relation::Sequence {
                owned_by: owned_by.map(str::to_string),
                origin,
                last_value: None,
                grants: HashSet::new(),
            },
        );
    }

    pub fn grant_counter_access(&self, counter: &str, role: &str) {
        if let Some(Relation::Sequence { grants, .. }) =
            self.shared.catalog().relations.get_mut(counter)
        {
            grants.insert(role.to_string());
        }
    }

    /// Draws the next value from a counter, like nextval.
    pub fn next_value(&self, counter: &str) -> Option<i64> {
        match self.shared.catalog().relations.get_mut(counter) {
            Some(Relation::Sequence {
                origin, last_value, ..
            }) => {
                let next = last_value.map_or(*origin, |v| v + 1);
                *last_value = Some(next);
                Some(next)
            }
            _ => None,
        }
    }

    /// Moves a counter to `value`, like setval.
    pub fn set_counter(&self, counter: &str, value: i64) {
        if let Some(Relation::Sequence { last_value, .. }) =
            self.shared.catalog().relations.get_mut(counter)
        {
            *last_value = Some(value);
        }
    }

    /// Marks a writer as in flight on `relation` until the guard is dropped.
    pub fn begin_write(&self, relation: &str) -> WriterGuard {
        *self
            .shared
            .catalog()
            .writers
            .entry(relation.to_string())
            .or_default() += 1;

        WriterGuard {
            shared: self.shared.clone(),
            relation: relation.to_string(),
        }
    }

    pub fn register_list_function<F>(&self, name: &str, function: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.shared
            .catalog()
            .list_functions
            .insert(name.to_string(), Arc::new(function));
    }

    pub fn set_command_handler<F>(&self, handler: F)
    where
        F: Fn(&CommandInvocation) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        self.shared.catalog().command_handler = Some(Arc::new(handler));
    }

    // None goes back to the wall clock
    pub fn set_now(&self, now: Option<DateTime<Utc>>) {
        self.shared.catalog().clock = now;
    }

    /// Drops a relation and the sequences it owns, returning every dropped name.
    pub fn drop_relation(&self, name: &str) -> Vec<String> {
        let mut catalog = self.shared.catalog();
        if catalog.relations.remove(name).is_none() {
            return Vec::new();
        }

        let owned: Vec<String> = catalog
            .relations
            .iter()
            .filter(|(_, relation)| {
                matches!(relation, Relation::Sequence { owned_by: Some(owner), .. } if owner == name)
            })
            .map(|(sequence, _)| sequence.clone())
            .collect();
        for sequence in &owned {
            catalog.relations.remove(sequence);
        }

        let mut dropped = vec![name.to_string()];
        dropped.extend(owned);
        dropped
    }

    /// Every command call, including ones that failed or were rolled back.
    pub fn attempts(&self) -> Vec<CommandInvocation> {
        self.shared.catalog().attempts.clone()
    }

    /// Command calls whose transaction committed.
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.shared.catalog().committed.clone()
    }

    pub fn ledger(&self, pipeline: &str) -> Vec<String> {
        self.shared
            .catalog()
            .ledger
            .get(pipeline)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_pipeline(&self, pipeline: &str) -> bool {
        let catalog = self.shared.catalog();
        catalog.pipelines.contains_key(pipeline) || catalog.states.contains_key(pipeline)
    }
}

pub struct WriterGuard {
    shared: Arc<Shared>,
    relation: String,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Some(count) = self.shared.catalog().writers.get_mut(&self.relation) {
            *count = count.saturating_sub(1);
        }
        self.shared.writers_changed.notify_waiters();
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    type Transaction = MemoryTransaction;

    async fn begin(
        &self,
        _principal: &ServicePrincipal,
    ) -> Result<MemoryTransaction, PipelineError> {
        Ok(MemoryTransaction {
            shared: self.shared.clone(),
            row_locks: HashMap::new(),
            staged: Vec::new(),
        })
    }
}

enum Write {
    InsertPipeline(Pipeline),
    DeletePipeline(String),
    InsertState(String, PipelineState),
    SequenceWatermark(String, Option<i64>),
    TimeIntervalWatermark(String, Option<DateTime<Utc>>),
    RecordFiles(String, Vec<String>),
    ClearFiles(String),
    Command(CommandInvocation),
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    row_locks: HashMap<String, OwnedMutexGuard<()>>,
    staged: Vec<Write>,
}

impl MemoryTransaction {
    fn require_state(&self, pipeline: &str) -> Result<(), PipelineError> {
        if self.shared.catalog().states.contains_key(pipeline) {
            Ok(())
        } else {
            Err(PipelineError::NotFound(pipeline.to_string()))
        }
    }

    fn staged_insert(&self, name: &str) -> bool {
        self.staged
            .iter()
            .any(|write| matches!(write, Write::InsertPipeline(p) if p.name == name))
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.row_locks.is_empty() {
            return;
        }
        // Guards go first, so the shared locks are no longer referenced from here
        let pipelines: Vec<String> = self.row_locks.drain().map(|(name, _)| name).collect();
        self.shared.release_row_locks(pipelines);
    }
}

fn apply(catalog: &mut Catalog, write: Write) {
    match write {
        Write::InsertPipeline(pipeline) => {
            catalog.pipelines.insert(pipeline.name.clone(), pipeline);
        }
        Write::DeletePipeline(name) => {
            catalog.pipelines.remove(&name);
            catalog.states.remove(&name);
            catalog.ledger.remove(&name);
        }
        Write::InsertState(name, state) => {
            catalog.states.insert(name, state);
        }
        Write::SequenceWatermark(name, value) => {
            if let Some(PipelineState::Sequence(state)) = catalog.states.get_mut(&name) {
                state.last_processed = value;
            }
        }
        Write::TimeIntervalWatermark(name, value) => {
            if let Some(PipelineState::TimeInterval(state)) = catalog.states.get_mut(&name) {
                state.last_processed = value;
            }
        }
        Write::RecordFiles(name, paths) => {
            catalog.ledger.entry(name).or_default().extend(paths);
        }
        Write::ClearFiles(name) => {
            catalog.ledger.remove(&name);
        }
        Write::Command(invocation) => catalog.committed.push(invocation),
    }
}

// Highest $n placeholder used by a command
fn highest_parameter(command: &str) -> usize {
    let mut highest = 0;
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        if let Ok(n) = digits.parse::<usize>() {
            highest = highest.max(n);
        }
    }
    highest
}

#[async_trait]
impl PipelineTransaction for MemoryTransaction {
    async fn insert_pipeline(&mut self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        let exists = self.shared.catalog().pipelines.contains_key(&pipeline.name);
        if exists || self.staged_insert(&pipeline.name) {
            return Err(PipelineError::AlreadyExists(pipeline.name.clone()));
        }
        self.staged.push(Write::InsertPipeline(pipeline.clone()));
        Ok(())
    }

    async fn get_pipeline(&mut self, name: &str) -> Result<Option<Pipeline>, PipelineError> {
        Ok(self.shared.catalog().pipelines.get(name).cloned())
    }

    async fn delete_pipeline(&mut self, name: &str) -> Result<bool, PipelineError> {
        let existed = self.shared.catalog().pipelines.contains_key(name);
        self.staged.push(Write::DeletePipeline(name.to_string()));
        Ok(existed)
    }

    async fn pipelines_by_source(&mut self, object: &str) -> Result<Vec<String>, PipelineError> {
        let catalog = self.shared.catalog();
        let names: BTreeSet<String> = catalog
            .pipelines
            .values()
            .filter(|pipeline| {
                let by_source = pipeline.source.as_deref() == Some(object);
                let by_counter = matches!(
                    catalog.states.get(&pipeline.name),
                    Some(PipelineState::Sequence(state))
                        if state.counter == object || state.relation == object
                );
                by_source || by_counter
            })
            .map(|pipeline| pipeline.name.clone())
            .collect();

        Ok(names.into_iter().collect())
    }

    async fn describe_source(
        &mut self,
        reference: &str,
    ) -> Result<Option<SourceObject>, PipelineError> {
        let catalog = self.shared.catalog();
        let object = catalog.relations.get(reference).map(|relation| match relation {
            Relation::Table | Relation::ForeignTable => SourceObject::Table {
                name: reference.to_string(),
                owned_sequences: catalog
                    .relations
                    .iter()
                    .filter(|(_, r)| {
                        matches!(r, Relation::Sequence { owned_by: Some(owner), .. } if owner == reference)
                    })
                    .map(|(name, _)| name.clone())
                    .collect(),
            },
            Relation::View => SourceObject::Other {
                name: reference.to_string(),
                kind: "view".to_string(),
            },
            Relation::Sequence { owned_by, .. } => SourceObject::Sequence {
                name: reference.to_string(),
                owned_by: owned_by.clone(),
            },
        });

        Ok(object)
    }

    async fn resolve_list_function(
        &mut self,
        name: &str,
    ) -> Result<Option<String>, PipelineError> {
        let known = self.shared.catalog().list_functions.contains_key(name);
        Ok(known.then(|| name.to_string()))
    }

    async fn validate_command(
        &mut self,
        command: &str,
        shape: ParamShape,
    ) -> Result<(), PipelineError> {
        if command.trim().is_empty() {
            return Err(PipelineError::invalid("command cannot be empty"));
        }

        let parameters = highest_parameter(command);
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
        let allowed = matches!(
            self.shared.catalog().relations.get(counter),
            Some(Relation::Sequence { grants, .. }) if grants.contains(&caller.role)
        );
        Ok(allowed)
    }

    async fn insert_state(
        &mut self,
        pipeline: &str,
        state: &PipelineState,
    ) -> Result<(), PipelineError> {
        self.staged
            .push(Write::InsertState(pipeline.to_string(), state.clone()));
        Ok(())
    }

    async fn get_state(&mut self, pipeline: &Pipeline) -> Result<PipelineState, PipelineError> {
        self.shared
            .catalog()
            .states
            .get(&pipeline.name)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(pipeline.name.clone()))
    }

    async fn lock_state(&mut self, pipeline: &Pipeline) -> Result<PipelineState, PipelineError> {
        if !self.row_locks.contains_key(&pipeline.name) {
            let lock = self.shared.row_lock(&pipeline.name);
            let guard = lock.lock_owned().await;
            self.row_locks.insert(pipeline.name.clone(), guard);
        }
        self.get_state(pipeline).await
    }

    async fn set_sequence_watermark(
        &mut self,
        pipeline: &str,
        last_processed: Option<i64>,
    ) -> Result<(), PipelineError> {
        self.require_state(pipeline)?;
        self.staged
            .push(Write::SequenceWatermark(pipeline.to_string(), last_processed));
        Ok(())
    }

    async fn set_time_interval_watermark(
        &mut self,
        pipeline: &str,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<(), PipelineError> {
        self.require_state(pipeline)?;
        self.staged.push(Write::TimeIntervalWatermark(
            pipeline.to_string(),
            last_processed,
        ));
        Ok(())
    }

    async fn processed_files(&mut self, pipeline: &str) -> Result<HashSet<String>, PipelineError> {
        Ok(self
            .shared
            .catalog()
            .ledger
            .get(pipeline)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_processed_files(
        &mut self,
        pipeline: &str,
        paths: &[String],
    ) -> Result<(), PipelineError> {
        self.staged
            .push(Write::RecordFiles(pipeline.to_string(), paths.to_vec()));
        Ok(())
    }

    async fn clear_processed_files(&mut self, pipeline: &str) -> Result<u64, PipelineError> {
        let count = self
            .shared
            .catalog()
            .ledger
            .get(pipeline)
            .map_or(0, BTreeSet::len);
        self.staged.push(Write::ClearFiles(pipeline.to_string()));
        Ok(count as u64)
    }

    async fn counter_position(&mut self, counter: &str) -> Result<CounterPosition, PipelineError> {
        match self.shared.catalog().relations.get(counter) {
            Some(Relation::Sequence {
                origin, last_value, ..
            }) => Ok(CounterPosition {
                origin: *origin,
                last_value: *last_value,
            }),
            _ => Err(PipelineError::invalid(format!(
                "sequence {counter} does not exist"
            ))),
        }
    }

    async fn wait_for_writers(
        &mut self,
        relation: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        if !self.shared.catalog().relations.contains_key(relation) {
            return Err(PipelineError::invalid(format!(
                "relation {relation} does not exist"
            )));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before checking, so a writer finishing in between still wakes us
            let finished = self.shared.writers_changed.notified();
            if self.shared.active_writers(relation) == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, finished).await.is_err() {
                return Err(PipelineError::ResolutionTimeout {
                    relation: relation.to_string(),
                    timeout,
                });
            }
        }
    }

    async fn now(&mut self) -> Result<DateTime<Utc>, PipelineError> {
        Ok(self.shared.catalog().clock.unwrap_or_else(Utc::now))
    }

    async fn list_files(
        &mut self,
        _caller: &Caller,
        function: &str,
        pattern: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let function = self
            .shared
            .catalog()
            .list_functions
            .get(function)
            .cloned()
            .ok_or_else(|| {
                PipelineError::invalid(format!("function {function}(text) does not exist"))
            })?;

        Ok(function(pattern))
    }

    async fn run_command(
        &mut self,
        pipeline: &Pipeline,
        caller: &Caller,
        params: &CommandParams,
    ) -> Result<(), PipelineError> {
        let invocation = CommandInvocation {
            pipeline: pipeline.name.clone(),
            role: caller.role.clone(),
            command: pipeline.command.clone(),
            params: params.clone(),
        };

        let handler = {
            let mut catalog = self.shared.catalog();
            catalog.attempts.push(invocation.clone());
            catalog.command_handler.clone()
        };

        if let Some(handler) = handler {
            handler(&invocation).map_err(|source| PipelineError::CommandFailed {
                pipeline: pipeline.name.clone(),
                source,
            })?;
        }

        self.staged.push(Write::Command(invocation));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), PipelineError> {
        let staged = std::mem::take(&mut self.staged);
        let mut catalog = self.shared.catalog();
        for write in &staged {
            if let Write::InsertPipeline(pipeline) = write {
                if catalog.pipelines.contains_key(&pipeline.name) {
                    return Err(PipelineError::AlreadyExists(pipeline.name.clone()));
                }
            }
        }

        for write in staged {
            apply(&mut catalog, write);
        }

        Ok(())
    }

    async fn rollback(self) -> Result<(), PipelineError> {
        Ok(())
    }
}
