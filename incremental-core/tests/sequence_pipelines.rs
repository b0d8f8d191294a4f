use std::sync::Arc;
use std::time::Duration;

use common::{
    owner, sequence_watermark, setup, stranger, superuser, EVENTS, EVENTS_SEQ, OWNER,
};
use incremental_core::{
    Caller, CommandError, CommandParams, ExecutionOutcome, NewSequencePipeline, PipelineError,
    PipelineState, ProcessedUnit, SequenceRange,
};

mod common;

const ROLLUP: &str =
    "insert into events_agg select count(*) from events where event_id between $1 and $2";

fn rollup(name: &str) -> NewSequencePipeline {
    NewSequencePipeline::new(name, EVENTS_SEQ, ROLLUP)
        .schedule(None)
        .execute_immediately(false)
}

#[tokio::test]
async fn processes_new_range_then_does_nothing() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 100);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();

    let outcome = manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Processed(vec![ProcessedUnit::Range(SequenceRange {
            start: 1,
            end: 100
        })])
    );
    assert_eq!(
        sequence_watermark(&manager, "events-rollup").await,
        Some(100)
    );

    let calls = store.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params, CommandParams::Range(1, 100));
    assert_eq!(calls[0].role, OWNER);

    // Nothing new arrived
    let outcome = manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();
    assert!(outcome.is_noop());
    assert_eq!(
        sequence_watermark(&manager, "events-rollup").await,
        Some(100)
    );
    assert_eq!(store.invocations().len(), 1);
}

#[tokio::test]
async fn every_value_is_processed_exactly_once() {
    let (manager, store) = setup();
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();

    let mut last_watermark = None;
    let mut drawn = 0;
    for batch in [3, 0, 7, 1, 0, 12, 0, 0, 5] {
        for _ in 0..batch {
            store.next_value(EVENTS_SEQ).unwrap();
            drawn += 1;
        }
        manager
            .execute_pipeline(&owner(), "events-rollup")
            .await
            .unwrap();

        let watermark = sequence_watermark(&manager, "events-rollup").await;
        assert!(watermark >= last_watermark);
        last_watermark = watermark;
    }

    let mut next = 1;
    for call in store.invocations() {
        let CommandParams::Range(start, end) = call.params else {
            panic!("unexpected params {:?}", call.params);
        };
        assert_eq!(start, next);
        assert!(end >= start);
        next = end + 1;
    }
    assert_eq!(next - 1, drawn);
    assert_eq!(last_watermark, Some(drawn));
}

#[tokio::test]
async fn table_resolves_to_its_owned_sequence() {
    let (manager, _store) = setup();
    manager
        .create_sequence_pipeline(
            &owner(),
            NewSequencePipeline::new("by-table", EVENTS, ROLLUP)
                .schedule(None)
                .execute_immediately(false),
        )
        .await
        .unwrap();

    let description = manager
        .describe_pipeline(&owner(), "by-table")
        .await
        .unwrap();
    assert_eq!(description.pipeline.source.as_deref(), Some(EVENTS_SEQ));
    assert_eq!(description.pipeline.owner, OWNER);
    let PipelineState::Sequence(state) = description.state else {
        panic!("expected sequence state");
    };
    assert_eq!(state.counter, EVENTS_SEQ);
    assert_eq!(state.relation, EVENTS);
    assert_eq!(state.last_processed, None);
}

#[tokio::test]
async fn foreign_table_resolves_to_its_owned_sequence() {
    let (manager, store) = setup();
    store.register_foreign_table("remote.events");
    store.register_sequence("remote.events_id_seq", Some("remote.events"), 1);
    store.grant_counter_access("remote.events_id_seq", OWNER);
    store.set_counter("remote.events_id_seq", 4);

    manager
        .create_sequence_pipeline(
            &owner(),
            NewSequencePipeline::new("remote-rollup", "remote.events", ROLLUP).schedule(None),
        )
        .await
        .unwrap();

    assert_eq!(
        sequence_watermark(&manager, "remote-rollup").await,
        Some(4)
    );
}

#[tokio::test]
async fn rejects_unsupported_counters() {
    let (manager, store) = setup();
    store.register_table("public.no_ids");
    store.register_table("public.two_ids");
    store.register_sequence("public.two_ids_a_seq", Some("public.two_ids"), 1);
    store.register_sequence("public.two_ids_b_seq", Some("public.two_ids"), 1);
    store.register_sequence("public.free_seq", None, 1);
    store.register_view("public.events_view");

    for counter in [
        "public.no_ids",
        "public.two_ids",
        "public.free_seq",
        "public.events_view",
        "public.missing",
    ] {
        let result = manager
            .create_sequence_pipeline(
                &owner(),
                NewSequencePipeline::new("bad", counter, ROLLUP)
                    .schedule(None)
                    .execute_immediately(false),
            )
            .await;
        assert!(
            matches!(result, Err(PipelineError::InvalidConfiguration(_))),
            "{counter} should be rejected, got {result:?}"
        );
    }

    assert!(!store.contains_pipeline("bad"));
}

#[tokio::test]
async fn command_must_fit_two_parameters() {
    let (manager, store) = setup();
    let result = manager
        .create_sequence_pipeline(
            &owner(),
            NewSequencePipeline::new("bad", EVENTS_SEQ, "select $1, $2, $3")
                .schedule(None)
                .execute_immediately(false),
        )
        .await;

    assert!(matches!(
        result,
        Err(PipelineError::InvalidConfiguration(_))
    ));
    assert!(!store.contains_pipeline("bad"));
}

#[tokio::test]
async fn only_owner_or_privileged_may_operate() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 10);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();

    let denied = [
        manager.execute_pipeline(&stranger(), "events-rollup").await.err(),
        manager.reset_pipeline(&stranger(), "events-rollup").await.err(),
        manager.drop_pipeline(&stranger(), "events-rollup").await.err(),
    ];
    for error in denied {
        assert!(matches!(error, Some(PipelineError::PermissionDenied(_))));
    }
    assert!(store.invocations().is_empty());

    let outcome = manager
        .execute_pipeline(&superuser(), "events-rollup")
        .await
        .unwrap();
    assert_eq!(outcome.units().len(), 1);
}

#[tokio::test]
async fn owner_needs_access_to_the_counter() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 10);
    let bob = Caller::new("bob");
    manager
        .create_sequence_pipeline(&bob, rollup("bobs-rollup"))
        .await
        .unwrap();

    let result = manager.execute_pipeline(&bob, "bobs-rollup").await;
    assert!(matches!(result, Err(PipelineError::PermissionDenied(_))));

    store.grant_counter_access(EVENTS_SEQ, "bob");
    let outcome = manager.execute_pipeline(&bob, "bobs-rollup").await.unwrap();
    assert!(!outcome.is_noop());
}

#[tokio::test]
async fn unknown_pipeline_is_not_found() {
    let (manager, _store) = setup();
    for result in [
        manager.execute_pipeline(&owner(), "nope").await.err(),
        manager.reset_pipeline(&owner(), "nope").await.err(),
        manager.drop_pipeline(&owner(), "nope").await.err(),
    ] {
        assert!(matches!(result, Some(PipelineError::NotFound(_))));
    }
}

#[tokio::test]
async fn failed_command_leaves_watermark_alone() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 100);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();

    store.set_command_handler(|_| Err(CommandError::new("relation \"events_agg\" does not exist")));
    let result = manager.execute_pipeline(&owner(), "events-rollup").await;
    assert!(matches!(
        result,
        Err(PipelineError::CommandFailed { ref pipeline, .. }) if pipeline == "events-rollup"
    ));
    assert_eq!(sequence_watermark(&manager, "events-rollup").await, None);
    assert_eq!(store.attempts().len(), 1);
    assert!(store.invocations().is_empty());

    // Cancellation counts as failure too
    store.set_command_handler(|_| Err(CommandError::cancelled("canceling statement due to statement timeout")));
    assert!(manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .is_err());
    assert_eq!(sequence_watermark(&manager, "events-rollup").await, None);

    // The next attempt retries the same range
    store.set_command_handler(|_| Ok(()));
    manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();
    assert_eq!(store.invocations()[0].params, CommandParams::Range(1, 100));
    assert_eq!(
        sequence_watermark(&manager, "events-rollup").await,
        Some(100)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waits_for_in_flight_writers() {
    let (manager, store) = setup();
    let manager = Arc::new(manager);
    store.set_counter(EVENTS_SEQ, 100);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();
    manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();

    // A writer drew 101 but has not committed its row yet
    let writer = store.begin_write(EVENTS);
    assert_eq!(store.next_value(EVENTS_SEQ), Some(101));

    let mut execution = tokio::spawn({
        let manager = manager.clone();
        async move {
            let caller = owner();
            manager.execute_pipeline(&caller, "events-rollup").await
        }
    });

    let still_waiting = tokio::time::timeout(Duration::from_millis(50), &mut execution).await;
    assert!(still_waiting.is_err());
    assert_eq!(store.invocations().len(), 1);

    drop(writer);
    let outcome = execution.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Processed(vec![ProcessedUnit::Range(SequenceRange {
            start: 101,
            end: 101
        })])
    );
}

#[tokio::test]
async fn gives_up_waiting_for_writers() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 5);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();

    let _writer = store.begin_write(EVENTS);
    let result = manager.execute_pipeline(&owner(), "events-rollup").await;

    assert!(matches!(
        result,
        Err(PipelineError::ResolutionTimeout { ref relation, .. }) if relation == EVENTS
    ));
    assert!(store.attempts().is_empty());
    assert_eq!(sequence_watermark(&manager, "events-rollup").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_invocations_never_overlap() {
    let (manager, store) = setup();
    let manager = Arc::new(manager);
    store.set_counter(EVENTS_SEQ, 100);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let caller = owner();
                manager.execute_pipeline(&caller, "events-rollup").await
            })
        })
        .collect();

    let mut processed = 0;
    for run in futures::future::join_all(runs).await {
        if !run.unwrap().unwrap().is_noop() {
            processed += 1;
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(store.invocations().len(), 1);
    assert_eq!(store.invocations()[0].params, CommandParams::Range(1, 100));
}

#[tokio::test]
async fn reset_replays_from_origin() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 40);
    manager
        .create_sequence_pipeline(&owner(), rollup("events-rollup"))
        .await
        .unwrap();
    let first = manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();

    manager
        .reset_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();
    assert_eq!(sequence_watermark(&manager, "events-rollup").await, None);

    let again = manager
        .execute_pipeline(&owner(), "events-rollup")
        .await
        .unwrap();
    assert_eq!(first, again);
}

#[tokio::test]
async fn execute_immediately_processes_existing_rows() {
    let (manager, store) = setup();
    store.set_counter(EVENTS_SEQ, 7);
    manager
        .create_sequence_pipeline(
            &owner(),
            NewSequencePipeline::new("events-rollup", EVENTS_SEQ, ROLLUP),
        )
        .await
        .unwrap();

    assert_eq!(store.invocations().len(), 1);
    assert_eq!(sequence_watermark(&manager, "events-rollup").await, Some(7));

    let job = manager.scheduler().job("pipeline:events-rollup").unwrap();
    assert_eq!(job.schedule, "* * * * *");
    assert_eq!(job.owner, OWNER);
}
