use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use incremental_core::{
    Caller, EngineConfig, MemoryPipelineStore, MemoryScheduler, PipelineManager, PipelineState,
};

pub type TestManager = PipelineManager<MemoryPipelineStore, MemoryScheduler>;

pub const OWNER: &str = "alice";
#[allow(dead_code)]
pub const EVENTS: &str = "public.events";
#[allow(dead_code)]
pub const EVENTS_SEQ: &str = "public.events_event_id_seq";
#[allow(dead_code)]
pub const LIST_FUNCTION: &str = "test.list_files";

#[allow(dead_code)]
pub fn owner() -> Caller {
    Caller::new(OWNER)
}

#[allow(dead_code)]
pub fn stranger() -> Caller {
    Caller::new("mallory")
}

#[allow(dead_code)]
pub fn superuser() -> Caller {
    Caller::privileged("postgres")
}

// A store with an events table whose id sequence alice may use, and a manager on top of it
#[allow(dead_code)]
pub fn setup() -> (TestManager, MemoryPipelineStore) {
    let store = MemoryPipelineStore::new();
    store.register_table(EVENTS);
    store.register_sequence(EVENTS_SEQ, Some(EVENTS), 1);
    store.grant_counter_access(EVENTS_SEQ, OWNER);

    let config = EngineConfig {
        writer_wait_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let manager = PipelineManager::new(store.clone(), MemoryScheduler::new(), config);

    (manager, store)
}

#[allow(dead_code)]
pub fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, minute, second)
        .unwrap()
}

#[allow(dead_code)]
pub async fn sequence_watermark(manager: &TestManager, name: &str) -> Option<i64> {
    match manager.describe_pipeline(&superuser(), name).await.unwrap().state {
        PipelineState::Sequence(state) => state.last_processed,
        other => panic!("not a sequence pipeline: {other:?}"),
    }
}

#[allow(dead_code)]
pub async fn time_watermark(manager: &TestManager, name: &str) -> Option<DateTime<Utc>> {
    match manager.describe_pipeline(&superuser(), name).await.unwrap().state {
        PipelineState::TimeInterval(state) => state.last_processed,
        other => panic!("not a time interval pipeline: {other:?}"),
    }
}
