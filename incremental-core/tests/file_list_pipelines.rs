use std::sync::{Arc, Mutex};

use common::{owner, setup, LIST_FUNCTION};
use incremental_core::{
    CommandError, CommandParams, ExecutionOutcome, MemoryPipelineStore, NewFileListPipeline,
    PipelineError, PipelineState, ProcessedUnit, DEFAULT_LIST_FUNCTION,
};

mod common;

const PATTERN: &str = "s3://landing/events/*.csv";

type Listing = Arc<Mutex<Vec<String>>>;

fn files(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

// Registers a list function returning whatever is currently in the shared listing
fn serve_listing(store: &MemoryPipelineStore, names: &[&str]) -> Listing {
    let listing = Arc::new(Mutex::new(files(names)));
    let served = listing.clone();
    store.register_list_function(LIST_FUNCTION, move |pattern| {
        assert_eq!(pattern, PATTERN);
        served.lock().unwrap().clone()
    });
    listing
}

fn import(name: &str, batched: bool) -> NewFileListPipeline {
    let command = if batched {
        "select import_many($1)"
    } else {
        "select import_one($1)"
    };
    NewFileListPipeline::new(name, PATTERN, command)
        .batched(batched)
        .list_function(LIST_FUNCTION)
        .schedule(None)
        .execute_immediately(false)
}

#[tokio::test]
async fn batched_run_splits_into_chunks_and_records_each() {
    let (manager, store) = setup();
    serve_listing(&store, &["a", "b", "c"]);
    manager
        .create_file_list_pipeline(&owner(), import("imports", true).max_batch_size(2))
        .await
        .unwrap();

    // Ledger as the command sees it on every call
    let observed = Arc::new(Mutex::new(Vec::new()));
    store.set_command_handler({
        let store = store.clone();
        let observed = observed.clone();
        move |_| {
            observed.lock().unwrap().push(store.ledger("imports"));
            Ok(())
        }
    });

    let outcome = manager.execute_pipeline(&owner(), "imports").await.unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Processed(vec![
            ProcessedUnit::Files(files(&["a", "b"])),
            ProcessedUnit::Files(files(&["c"])),
        ])
    );

    let calls: Vec<_> = store.invocations().into_iter().map(|c| c.params).collect();
    assert_eq!(
        calls,
        vec![
            CommandParams::Files(files(&["a", "b"])),
            CommandParams::Files(files(&["c"])),
        ]
    );
    assert_eq!(
        *observed.lock().unwrap(),
        vec![Vec::<String>::new(), files(&["a", "b"])]
    );
    assert_eq!(store.ledger("imports"), files(&["a", "b", "c"]));

    assert!(manager
        .execute_pipeline(&owner(), "imports")
        .await
        .unwrap()
        .is_noop());
}

#[tokio::test]
async fn failed_chunk_keeps_committed_chunks() {
    let (manager, store) = setup();
    serve_listing(&store, &["a", "b", "c"]);
    manager
        .create_file_list_pipeline(&owner(), import("imports", true).max_batch_size(2))
        .await
        .unwrap();

    store.set_command_handler(|call| match &call.params {
        CommandParams::Files(paths) if paths.iter().any(|p| p == "c") => {
            Err(CommandError::new("could not open file \"c\""))
        }
        _ => Ok(()),
    });

    let result = manager.execute_pipeline(&owner(), "imports").await;
    assert!(matches!(result, Err(PipelineError::CommandFailed { .. })));
    assert_eq!(store.ledger("imports"), files(&["a", "b"]));

    store.set_command_handler(|_| Ok(()));
    let outcome = manager.execute_pipeline(&owner(), "imports").await.unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Processed(vec![ProcessedUnit::Files(files(&["c"]))])
    );
}

#[tokio::test]
async fn unbounded_batch_takes_everything() {
    let (manager, store) = setup();
    serve_listing(&store, &["a", "b", "c", "d", "e"]);
    manager
        .create_file_list_pipeline(&owner(), import("imports", true).max_batch_size(0))
        .await
        .unwrap();

    manager.execute_pipeline(&owner(), "imports").await.unwrap();
    assert_eq!(
        store.invocations()[0].params,
        CommandParams::Files(files(&["a", "b", "c", "d", "e"]))
    );
}

#[tokio::test]
async fn non_batched_files_are_never_processed_twice() {
    let (manager, store) = setup();
    let listing = serve_listing(&store, &["a", "b"]);
    manager
        .create_file_list_pipeline(&owner(), import("imports", false))
        .await
        .unwrap();

    manager.execute_pipeline(&owner(), "imports").await.unwrap();
    manager.execute_pipeline(&owner(), "imports").await.unwrap();
    listing.lock().unwrap().push("c".to_string());
    let outcome = manager.execute_pipeline(&owner(), "imports").await.unwrap();

    assert_eq!(
        outcome,
        ExecutionOutcome::Processed(vec![ProcessedUnit::Files(files(&["c"]))])
    );
    let calls: Vec<_> = store.invocations().into_iter().map(|c| c.params).collect();
    assert_eq!(
        calls,
        vec![
            CommandParams::File("a".to_string()),
            CommandParams::File("b".to_string()),
            CommandParams::File("c".to_string()),
        ]
    );
}

#[tokio::test]
async fn reset_forgets_processed_files() {
    let (manager, store) = setup();
    serve_listing(&store, &["a", "b"]);
    manager
        .create_file_list_pipeline(&owner(), import("imports", false))
        .await
        .unwrap();
    manager.execute_pipeline(&owner(), "imports").await.unwrap();

    manager.reset_pipeline(&owner(), "imports").await.unwrap();
    assert!(store.ledger("imports").is_empty());

    let outcome = manager.execute_pipeline(&owner(), "imports").await.unwrap();
    assert_eq!(outcome.units().len(), 2);
    assert_eq!(store.invocations().len(), 4);
}

#[tokio::test]
async fn defaults_to_the_configured_list_function() {
    let (manager, store) = setup();
    store.register_list_function(DEFAULT_LIST_FUNCTION, |_| Vec::new());
    manager
        .create_file_list_pipeline(
            &owner(),
            NewFileListPipeline::new("imports", PATTERN, "select import_one($1)")
                .schedule(None)
                .execute_immediately(false),
        )
        .await
        .unwrap();

    let description = manager.describe_pipeline(&owner(), "imports").await.unwrap();
    let PipelineState::FileList(state) = description.state else {
        panic!("expected file list state");
    };
    assert_eq!(state.list_function, DEFAULT_LIST_FUNCTION);
    assert!(!state.batched);
    assert_eq!(state.pattern, PATTERN);

    assert!(manager
        .execute_pipeline(&owner(), "imports")
        .await
        .unwrap()
        .is_noop());
}

#[tokio::test]
async fn rejects_unknown_list_function_and_wrong_arity() {
    let (manager, store) = setup();
    serve_listing(&store, &[]);

    let unknown = manager
        .create_file_list_pipeline(
            &owner(),
            import("imports", false).list_function("public.nope"),
        )
        .await;
    assert!(matches!(
        unknown,
        Err(PipelineError::InvalidConfiguration(_))
    ));

    let two_params = manager
        .create_file_list_pipeline(
            &owner(),
            NewFileListPipeline::new("imports", PATTERN, "select import_range($1, $2)")
                .list_function(LIST_FUNCTION)
                .schedule(None)
                .execute_immediately(false),
        )
        .await;
    assert!(matches!(
        two_params,
        Err(PipelineError::InvalidConfiguration(_))
    ));

    assert!(!store.contains_pipeline("imports"));
}
