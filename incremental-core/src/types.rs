use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Sequence,
    TimeInterval,
    FileList,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Sequence => "sequence",
            PipelineKind::TimeInterval => "time_interval",
            PipelineKind::FileList => "file_list",
        }
    }

    // The shape of the positional parameters a command of this kind is given
    pub fn param_shape(&self, batched: bool) -> ParamShape {
        match (self, batched) {
            (PipelineKind::Sequence, _) => ParamShape::BigintRange,
            (PipelineKind::TimeInterval, _) => ParamShape::TimestampRange,
            (PipelineKind::FileList, false) => ParamShape::Path,
            (PipelineKind::FileList, true) => ParamShape::PathArray,
        }
    }
}

impl FromStr for PipelineKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequence" => Ok(PipelineKind::Sequence),
            "time_interval" => Ok(PipelineKind::TimeInterval),
            "file_list" => Ok(PipelineKind::FileList),
            other => Err(PipelineError::invalid(format!(
                "{other} is not a valid pipeline kind"
            ))),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the pipeline registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub kind: PipelineKind,
    pub owner: String,
    // The counter for sequence pipelines, the optional source relation for time interval
    // pipelines, and nothing for file list pipelines
    pub source: Option<String>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    pub counter: String,
    // The table owning the counter, whose writers are waited on before advancing
    pub relation: String,
    pub last_processed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeIntervalState {
    pub interval: Duration,
    pub anchor: DateTime<Utc>,
    pub min_delay: Duration,
    pub batched: bool,
    pub last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListState {
    pub pattern: String,
    pub batched: bool,
    pub list_function: String,
    pub max_batch_size: Option<i32>,
}

/// Kind-specific configuration and watermark of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Sequence(SequenceState),
    TimeInterval(TimeIntervalState),
    FileList(FileListState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescription {
    pub pipeline: Pipeline,
    pub state: PipelineState,
}

/// The identity on whose behalf an operation is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub role: String,
    // Superusers and other roles allowed to manage pipelines they don't own
    pub privileged: bool,
}

impl Caller {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            privileged: false,
        }
    }

    pub fn privileged(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            privileged: true,
        }
    }

    pub fn can_manage(&self, pipeline: &Pipeline) -> bool {
        self.privileged || self.role == pipeline.owner
    }
}

/// The fixed identity used for reads and writes of the engine's internal tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePrincipal {
    pub role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    BigintRange,
    TimestampRange,
    Path,
    PathArray,
}

impl ParamShape {
    pub fn arity(&self) -> usize {
        match self {
            ParamShape::BigintRange | ParamShape::TimestampRange => 2,
            ParamShape::Path | ParamShape::PathArray => 1,
        }
    }
}

/// Values bound to the positional parameters of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandParams {
    Range(i64, i64),
    TimeRange(DateTime<Utc>, DateTime<Utc>),
    File(String),
    Files(Vec<String>),
}

/// What a relation reference points at, as seen in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceObject {
    Sequence {
        name: String,
        owned_by: Option<String>,
    },
    Table {
        name: String,
        owned_sequences: Vec<String>,
    },
    Other {
        name: String,
        kind: String,
    },
}

impl SourceObject {
    pub fn name(&self) -> &str {
        match self {
            SourceObject::Sequence { name, .. }
            | SourceObject::Table { name, .. }
            | SourceObject::Other { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterPosition {
    // The first value the counter hands out
    pub origin: i64,
    // None until the counter has handed out its first value
    pub last_value: Option<i64>,
}

/// An inclusive range of counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: i64,
    pub end: i64,
}

/// A half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessedUnit {
    Range(SequenceRange),
    Window(TimeWindow),
    Files(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    NoOp,
    Processed(Vec<ProcessedUnit>),
}

impl ExecutionOutcome {
    pub fn is_noop(&self) -> bool {
        matches!(self, ExecutionOutcome::NoOp)
    }

    pub fn units(&self) -> &[ProcessedUnit] {
        match self {
            ExecutionOutcome::NoOp => &[],
            ExecutionOutcome::Processed(units) => units,
        }
    }
}

// Time windows are binned against this origin when no start time is given
pub fn default_anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}
