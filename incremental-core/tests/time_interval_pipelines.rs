use chrono::{Duration, TimeZone, Utc};
use common::{at, owner, setup, time_watermark, EVENTS};
use incremental_core::{
    CommandError, CommandParams, ExecutionOutcome, NewTimeIntervalPipeline, PipelineError,
    PipelineState, ProcessedUnit, TimeWindow,
};

mod common;

const ROLLUP: &str = "insert into events_hourly select date_trunc('hour', ts), count(*) from events where ts >= $1 and ts < $2 group by 1";

fn hourly(name: &str) -> NewTimeIntervalPipeline {
    NewTimeIntervalPipeline::new(name, Duration::hours(1), ROLLUP)
        .start_time(at(1, 0, 0, 0))
        .schedule(None)
        .execute_immediately(false)
}

#[tokio::test]
async fn batched_run_covers_every_elapsed_interval_at_once() {
    let (manager, store) = setup();
    store.set_now(Some(at(1, 5, 10, 0)));
    manager
        .create_time_interval_pipeline(&owner(), hourly("hourly"))
        .await
        .unwrap();

    let outcome = manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Processed(vec![ProcessedUnit::Window(TimeWindow {
            start: at(1, 0, 0, 0),
            end: at(1, 5, 0, 0),
        })])
    );
    assert_eq!(
        store.invocations()[0].params,
        CommandParams::TimeRange(at(1, 0, 0, 0), at(1, 5, 0, 0))
    );
    assert_eq!(time_watermark(&manager, "hourly").await, Some(at(1, 5, 0, 0)));

    // The 05:00-06:00 interval has not finished yet
    let outcome = manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    assert!(outcome.is_noop());
    assert_eq!(store.invocations().len(), 1);
}

#[tokio::test]
async fn non_batched_run_calls_once_per_interval() {
    let (manager, store) = setup();
    store.set_now(Some(at(1, 3, 0, 30)));
    manager
        .create_time_interval_pipeline(&owner(), hourly("hourly").batched(false))
        .await
        .unwrap();

    let outcome = manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    assert_eq!(outcome.units().len(), 3);

    let calls: Vec<_> = store.invocations().into_iter().map(|c| c.params).collect();
    assert_eq!(
        calls,
        vec![
            CommandParams::TimeRange(at(1, 0, 0, 0), at(1, 1, 0, 0)),
            CommandParams::TimeRange(at(1, 1, 0, 0), at(1, 2, 0, 0)),
            CommandParams::TimeRange(at(1, 2, 0, 0), at(1, 3, 0, 0)),
        ]
    );
    assert_eq!(time_watermark(&manager, "hourly").await, Some(at(1, 3, 0, 0)));
}

#[tokio::test]
async fn intervals_wait_for_the_minimum_delay() {
    let (manager, store) = setup();
    store.set_now(Some(at(1, 1, 0, 29)));
    manager
        .create_time_interval_pipeline(&owner(), hourly("hourly"))
        .await
        .unwrap();

    // 29 seconds after the first interval closed, 30 are required
    assert!(manager
        .execute_pipeline(&owner(), "hourly")
        .await
        .unwrap()
        .is_noop());

    store.set_now(Some(at(1, 1, 0, 30)));
    assert!(!manager
        .execute_pipeline(&owner(), "hourly")
        .await
        .unwrap()
        .is_noop());
}

#[tokio::test]
async fn no_window_ends_within_the_delay() {
    let (manager, store) = setup();
    manager
        .create_time_interval_pipeline(
            &owner(),
            NewTimeIntervalPipeline::new("quarterly", Duration::minutes(15), ROLLUP)
                .start_time(at(1, 0, 0, 0))
                .min_delay(Duration::minutes(4))
                .batched(false)
                .schedule(None)
                .execute_immediately(false),
        )
        .await
        .unwrap();

    let mut now = at(1, 0, 0, 0);
    let mut seen = 0;
    for _ in 0..40 {
        now += Duration::minutes(7);
        store.set_now(Some(now));
        manager.execute_pipeline(&owner(), "quarterly").await.unwrap();

        let calls = store.invocations();
        for call in &calls[seen..] {
            let CommandParams::TimeRange(start, end) = call.params else {
                panic!("unexpected params {:?}", call.params);
            };
            assert_eq!(end - start, Duration::minutes(15));
            assert!(end + Duration::minutes(4) <= now);
        }
        seen = calls.len();
    }

    // 4h40m elapsed, 4h36m eligible
    assert_eq!(seen, 18);
}

#[tokio::test]
async fn batched_without_start_time_uses_default_anchor() {
    let (manager, store) = setup();
    store.set_now(Some(Utc.with_ymd_and_hms(2001, 1, 1, 3, 0, 30).unwrap()));
    manager
        .create_time_interval_pipeline(
            &owner(),
            NewTimeIntervalPipeline::new("hourly", Duration::hours(1), ROLLUP)
                .schedule(None)
                .execute_immediately(false),
        )
        .await
        .unwrap();

    let description = manager.describe_pipeline(&owner(), "hourly").await.unwrap();
    let PipelineState::TimeInterval(state) = description.state else {
        panic!("expected time interval state");
    };
    assert!(state.batched);
    assert_eq!(state.min_delay, Duration::seconds(30));

    manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    assert_eq!(
        store.invocations()[0].params,
        CommandParams::TimeRange(
            Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2001, 1, 1, 3, 0, 0).unwrap(),
        )
    );
}

#[tokio::test]
async fn rejects_invalid_configuration() {
    let (manager, store) = setup();

    let requests = [
        NewTimeIntervalPipeline::new("bad", Duration::hours(1), ROLLUP)
            .batched(false)
            .schedule(None),
        hourly("bad").min_delay(Duration::seconds(-1)),
        NewTimeIntervalPipeline::new("bad", Duration::zero(), ROLLUP).schedule(None),
        hourly("bad").source("public.missing"),
        NewTimeIntervalPipeline::new("bad", Duration::hours(1), "select $1, $2, $3")
            .schedule(None),
    ];

    for request in requests {
        let result = manager
            .create_time_interval_pipeline(&owner(), request.execute_immediately(false))
            .await;
        assert!(
            matches!(result, Err(PipelineError::InvalidConfiguration(_))),
            "got {result:?}"
        );
    }

    assert!(!store.contains_pipeline("bad"));
}

#[tokio::test]
async fn waits_for_writers_on_the_source() {
    let (manager, store) = setup();
    store.set_now(Some(at(1, 2, 0, 0)));
    manager
        .create_time_interval_pipeline(&owner(), hourly("hourly").source(EVENTS))
        .await
        .unwrap();

    let writer = store.begin_write(EVENTS);
    let result = manager.execute_pipeline(&owner(), "hourly").await;
    assert!(matches!(
        result,
        Err(PipelineError::ResolutionTimeout { .. })
    ));
    assert_eq!(time_watermark(&manager, "hourly").await, None);

    drop(writer);
    manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    assert_eq!(time_watermark(&manager, "hourly").await, Some(at(1, 1, 0, 0)));
}

#[tokio::test]
async fn failed_interval_keeps_earlier_progress() {
    let (manager, store) = setup();
    store.set_now(Some(at(1, 4, 0, 30)));
    manager
        .create_time_interval_pipeline(&owner(), hourly("hourly").batched(false))
        .await
        .unwrap();

    let broken = at(1, 1, 0, 0);
    store.set_command_handler(move |call| match call.params {
        CommandParams::TimeRange(start, _) if start == broken => {
            Err(CommandError::new("division by zero"))
        }
        _ => Ok(()),
    });

    let result = manager.execute_pipeline(&owner(), "hourly").await;
    assert!(matches!(result, Err(PipelineError::CommandFailed { .. })));
    assert_eq!(store.invocations().len(), 1);
    assert_eq!(time_watermark(&manager, "hourly").await, Some(at(1, 1, 0, 0)));

    // Resumes at the window that failed
    store.set_command_handler(|_| Ok(()));
    let outcome = manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    assert_eq!(outcome.units().len(), 3);
    assert_eq!(
        store.invocations()[1].params,
        CommandParams::TimeRange(at(1, 1, 0, 0), at(1, 2, 0, 0))
    );
}

#[tokio::test]
async fn reset_starts_over_from_the_anchor() {
    let (manager, store) = setup();
    store.set_now(Some(at(1, 2, 0, 30)));
    manager
        .create_time_interval_pipeline(&owner(), hourly("hourly").batched(false))
        .await
        .unwrap();
    manager.execute_pipeline(&owner(), "hourly").await.unwrap();

    manager.reset_pipeline(&owner(), "hourly").await.unwrap();
    assert_eq!(time_watermark(&manager, "hourly").await, None);

    manager.execute_pipeline(&owner(), "hourly").await.unwrap();
    let calls = store.invocations();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].params, calls[2].params);
    assert_eq!(calls[1].params, calls[3].params);
}
