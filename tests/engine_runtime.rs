// tests/engine_runtime.rs

use std::sync::Arc;

use tokio::sync::mpsc;

use ingestflow::config::ConfigFile;
use ingestflow::dag::NodeStatus;
use ingestflow::engine::{CoreRuntime, EngineEvent, Runtime, RuntimeOptions};
use ingestflow::events::PipelineEvent;
use ingestflow::pool::WorkerPool;
use ingestflow::sink::{register_sink_handlers, MemoryGraphSink, EMBEDDING_DIMS};
use ingestflow::types::{ChangeEventType, ChangeFragment, FragmentOperation, TaskType};
use ingestflow_test_utils::builders::{
    change_event, entity, entity_fragment, relationship_fragment, ConfigFileBuilder,
};
use ingestflow_test_utils::handlers::{FailingHandler, KeyedStore, RecordingHandler};
use ingestflow_test_utils::{init_tracing, pool_for, with_timeout};

fn config() -> ConfigFileBuilder {
    ConfigFileBuilder::new()
        .workers(2, 4)
        .batch_size(10)
        .batch_timeout_ms(20)
        .max_retries(3)
}

async fn engine(cfg: &ConfigFile, pool: &WorkerPool) -> (Runtime, mpsc::Sender<EngineEvent>) {
    pool.start().await.unwrap();
    let core = CoreRuntime::new(
        cfg,
        RuntimeOptions {
            exit_when_drained: true,
        },
    );
    Runtime::new(core, pool.clone(), cfg.batching.clone()).unwrap()
}

fn submit(id: &str, file: &str, fragments: Vec<ChangeFragment>) -> EngineEvent {
    EngineEvent::Submit {
        event: change_event(id, file, ChangeEventType::Modified),
        fragments,
    }
}

#[tokio::test]
async fn change_events_are_ingested_in_dependency_order() {
    init_tracing();
    let cfg = config().build();
    let pool = pool_for(&cfg);
    // Strict: a relationship written before both endpoints exist fails.
    let sink = Arc::new(MemoryGraphSink::strict());
    register_sink_handlers(&pool, sink.clone());
    let mut events = pool.event_bus().subscribe();
    let (runtime, tx) = engine(&cfg, &pool).await;

    let mut embedded = entity("fn:parse");
    embedded.embed = true;
    tx.send(submit(
        "ev1",
        "core/parser/lib.rs",
        vec![
            relationship_fragment("calls:parse->lex", "fn:parse", "fn:lex", FragmentOperation::Add),
            ChangeFragment::entity(FragmentOperation::Add, embedded),
            entity_fragment("fn:lex", FragmentOperation::Add),
        ],
    ))
    .await
    .unwrap();
    tx.send(EngineEvent::InputClosed).await.unwrap();

    let core = with_timeout(runtime.run()).await.unwrap();
    pool.stop().await.unwrap();

    let stats = core.stats();
    assert_eq!(stats.events_accepted, 1);
    assert_eq!(stats.tasks_completed, 5);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.tasks_retried, 0);
    assert!(core.is_drained());

    assert_eq!(sink.entity_count(), 2);
    assert_eq!(sink.relationship_count(), 1);
    assert_eq!(sink.embedding("fn:parse").map(|v| v.len()), Some(EMBEDDING_DIMS));
    assert!(sink.embedding("fn:lex").is_none());

    let mut completed_batches = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::BatchCompleted(_) => completed_batches += 1,
            PipelineEvent::BatchFailed { error, .. } => panic!("unexpected batch failure: {error}"),
            _ => {}
        }
    }
    assert!(completed_batches >= 3);
}

#[tokio::test]
async fn removals_are_applied_after_referencing_relationships() {
    init_tracing();
    let cfg = config().build();
    let pool = pool_for(&cfg);
    let sink = Arc::new(MemoryGraphSink::new());
    register_sink_handlers(&pool, sink.clone());
    let (runtime, tx) = engine(&cfg, &pool).await;
    tx.send(submit(
        "ev1",
        "core/graph/mod.rs",
        vec![
            entity_fragment("a", FragmentOperation::Add),
            entity_fragment("b", FragmentOperation::Add),
            relationship_fragment("a->b", "a", "b", FragmentOperation::Add),
        ],
    ))
    .await
    .unwrap();
    tx.send(EngineEvent::InputClosed).await.unwrap();
    with_timeout(runtime.run()).await.unwrap();
    assert!(sink.relationship("a->b").is_some());

    // The entity removal is listed first but waits for the relationship
    // removal that references it.
    let (runtime, tx) = engine(&cfg, &pool).await;
    tx.send(submit(
        "ev2",
        "core/graph/mod.rs",
        vec![
            entity_fragment("b", FragmentOperation::Remove),
            relationship_fragment("a->b", "a", "b", FragmentOperation::Remove),
        ],
    ))
    .await
    .unwrap();
    tx.send(EngineEvent::InputClosed).await.unwrap();
    let core = with_timeout(runtime.run()).await.unwrap();
    pool.stop().await.unwrap();

    let stats = core.stats();
    assert_eq!(stats.events_accepted, 1);
    assert_eq!(stats.tasks_completed, 3);
    assert!(core.dag().cycles().is_empty());
    assert!(sink.entity("a").is_some());
    assert!(sink.entity("b").is_none());
    assert!(sink.relationship("a->b").is_none());
}

#[tokio::test]
async fn retried_tasks_converge_to_the_same_state() {
    init_tracing();
    let cfg = config().build();
    let pool = pool_for(&cfg);
    let store = KeyedStore::new();
    // Writes land, but the first two attempts report failure.
    pool.register_handler(TaskType::EntityUpsert, store.writer(2));
    pool.register_handler(TaskType::Parse, RecordingHandler::new());
    let (runtime, tx) = engine(&cfg, &pool).await;

    tx.send(submit(
        "ev1",
        "core/store/mod.rs",
        vec![entity_fragment("fn:put", FragmentOperation::Add)],
    ))
    .await
    .unwrap();
    tx.send(EngineEvent::InputClosed).await.unwrap();

    let core = with_timeout(runtime.run()).await.unwrap();
    pool.stop().await.unwrap();

    let stats = core.stats();
    assert_eq!(stats.tasks_retried, 2);
    assert_eq!(stats.tasks_completed, 2);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(store.writes(), 3);
    assert_eq!(store.len(), 1);
    assert_eq!(
        store.get("fn:put").unwrap()["entity"]["id"],
        serde_json::json!("fn:put")
    );
}

#[tokio::test]
async fn exhausted_retries_fail_the_node_and_block_its_dependents() {
    init_tracing();
    let cfg = config().max_retries(1).build();
    let pool = pool_for(&cfg);
    let failing = FailingHandler::new();
    let recorder = RecordingHandler::new();
    pool.register_handler(TaskType::Parse, RecordingHandler::new());
    pool.register_handler(TaskType::EntityUpsert, failing.clone());
    pool.register_handler(TaskType::RelationshipUpsert, recorder.clone());
    let (runtime, tx) = engine(&cfg, &pool).await;

    tx.send(submit(
        "ev1",
        "core/io/mod.rs",
        vec![
            entity_fragment("a", FragmentOperation::Add),
            relationship_fragment("a->ext", "a", "ext", FragmentOperation::Add),
        ],
    ))
    .await
    .unwrap();
    tx.send(EngineEvent::InputClosed).await.unwrap();

    let core = with_timeout(runtime.run()).await.unwrap();
    pool.stop().await.unwrap();

    // One initial attempt plus one retry.
    assert_eq!(failing.calls(), 2);
    assert_eq!(core.stats().tasks_failed, 1);
    assert_eq!(core.dag().status_of("a"), Some(NodeStatus::Failed));
    assert_eq!(core.dag().status_of("a->ext"), Some(NodeStatus::Pending));
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn shutdown_request_stops_the_runtime() {
    let cfg = ConfigFileBuilder::new().build();
    let pool = pool_for(&cfg);
    pool.start().await.unwrap();
    let core = CoreRuntime::new(&cfg, RuntimeOptions::default());
    let (runtime, tx) = Runtime::new(core, pool.clone(), cfg.batching.clone()).unwrap();

    tx.send(EngineEvent::ShutdownRequested).await.unwrap();
    let core = with_timeout(runtime.run()).await.unwrap();
    assert_eq!(core.stats().events_accepted, 0);
    pool.stop().await.unwrap();
}
