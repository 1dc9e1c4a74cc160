// tests/worker_pool.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use proptest::prelude::*;
use serde_json::{json, Value};

use ingestflow::errors::{IngestError, WorkerError};
use ingestflow::events::PipelineEvent;
use ingestflow::pool::{QueueDepthEstimator, ScalingDecision, WorkerPool};
use ingestflow::types::{ExecutionMode, LoadEstimatorKind, TaskPayload, TaskType};
use ingestflow::worker::WorkerStatus;
use ingestflow_test_utils::builders::{task, ConfigFileBuilder};
use ingestflow_test_utils::handlers::{BlockingHandler, FailingHandler, RecordingHandler};
use ingestflow_test_utils::{init_tracing, pool_with_queue_depth, started_pool, with_timeout};

#[tokio::test]
async fn executes_task_on_an_idle_worker() {
    init_tracing();
    let pool = started_pool(&ConfigFileBuilder::new().workers(2, 2).build()).await;
    let recorder = RecordingHandler::new();
    pool.register_handler(TaskType::EntityUpsert, recorder.clone());

    let result = with_timeout(pool.execute_task(task("e1", TaskType::EntityUpsert)))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.task_id, "e1");
    assert_eq!(result.result, Some(json!({ "id": "e1" })));
    assert!(result.worker_id.is_some());
    assert_eq!(recorder.seen(), vec!["e1"]);

    let metrics = pool.metrics();
    assert_eq!(metrics.total_workers, 2);
    assert_eq!(metrics.idle, 2);
    assert_eq!(metrics.tasks_processed, 1);
    assert_eq!(metrics.tasks_failed, 0);

    pool.stop().await.unwrap();
    assert!(!pool.is_running());
    assert_eq!(pool.worker_count(), 0);
}

#[tokio::test]
async fn pool_level_faults_are_errors() {
    let cfg = ConfigFileBuilder::new().build();
    let pool = WorkerPool::new(cfg.pool);
    pool.register_handler(TaskType::Parse, RecordingHandler::new());

    let err = pool.execute_task(task("p1", TaskType::Parse)).await.unwrap_err();
    assert!(matches!(err, IngestError::PoolNotRunning));

    pool.start().await.unwrap();
    let err = pool
        .execute_task(task("m1", TaskType::Embedding))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NoHandler(TaskType::Embedding)));
    assert_eq!(err.code(), "NO_HANDLER");

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn handler_errors_come_back_as_failed_results() {
    let pool = started_pool(&ConfigFileBuilder::new().workers(1, 1).build()).await;
    let failing = FailingHandler::new();
    pool.register_handler(TaskType::RelationshipUpsert, failing.clone());

    let result = pool
        .execute_task(task("r1", TaskType::RelationshipUpsert))
        .await
        .unwrap();

    assert!(!result.success);
    let err = result.error.as_ref().unwrap();
    assert_eq!(err.code, WorkerError::TASK_FAILED);
    assert!(err.retryable);
    assert_eq!(err.task_id.as_deref(), Some("r1"));
    assert!(err.message.contains("handler rejected r1"));
    assert_eq!(failing.calls(), 1);

    // Below the restart threshold the worker goes back to idle.
    let id = pool.worker_ids()[0];
    assert_eq!(pool.worker_status(id), Some(WorkerStatus::Idle));
    assert_eq!(pool.metrics().error_rate, 1.0);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn a_worker_runs_at_most_one_task_at_a_time() {
    init_tracing();
    let pool = started_pool(&ConfigFileBuilder::new().workers(2, 2).build()).await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let current = current.clone();
        let peak = peak.clone();
        pool.register_handler(TaskType::EntityUpsert, move |t: TaskPayload| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<Value, anyhow::Error>(json!({ "id": t.id }))
            }
        });
    }

    // Without waiting, the third concurrent task finds no idle worker.
    let results = pool
        .execute_tasks(vec![
            task("a", TaskType::EntityUpsert),
            task("b", TaskType::EntityUpsert),
            task("c", TaskType::EntityUpsert),
        ])
        .await;
    assert!(results[0].as_ref().unwrap().success);
    assert!(results[1].as_ref().unwrap().success);
    match &results[2] {
        Err(IngestError::Worker(e)) => assert_eq!(e.code, WorkerError::UNAVAILABLE),
        other => panic!("expected NO_AVAILABLE_WORKERS, got {other:?}"),
    }

    // `submit_all` waits for workers instead; results keep input order.
    let tasks: Vec<TaskPayload> = (0..6)
        .map(|i| task(&format!("t{i}"), TaskType::EntityUpsert))
        .collect();
    let results = with_timeout(pool.submit_all(tasks)).await;
    let ids: Vec<String> = results
        .into_iter()
        .map(|r| {
            let r = r.unwrap();
            assert!(r.success);
            r.task_id
        })
        .collect();
    assert_eq!(ids, vec!["t0", "t1", "t2", "t3", "t4", "t5"]);
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn scales_up_in_steps_under_load_and_back_down_when_idle() {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .workers(1, 4)
        .load_estimator(LoadEstimatorKind::QueueDepth)
        .scale_up_above(5.0)
        .build();
    let depth = Arc::new(AtomicUsize::new(0));
    let reading = depth.clone();
    let pool = WorkerPool::builder(cfg.pool)
        .load_estimator(Arc::new(QueueDepthEstimator::new(move || {
            reading.load(Ordering::SeqCst)
        })))
        .build();
    let mut events = pool.event_bus().subscribe();
    pool.start().await.unwrap();
    assert_eq!(pool.worker_count(), 1);

    depth.store(100, Ordering::SeqCst);
    assert_eq!(pool.estimate_load(), 100.0);

    assert_eq!(pool.evaluate_scaling().await, ScalingDecision::ScaleUp(2));
    assert_eq!(pool.worker_count(), 3);
    assert_eq!(pool.evaluate_scaling().await, ScalingDecision::ScaleUp(1));
    assert_eq!(pool.worker_count(), 4);
    assert_eq!(pool.evaluate_scaling().await, ScalingDecision::Hold);
    assert_eq!(pool.worker_count(), 4);

    depth.store(0, Ordering::SeqCst);
    assert_eq!(pool.evaluate_scaling().await, ScalingDecision::ScaleDown(3));
    assert_eq!(pool.worker_count(), 1);

    // Every tick publishes a metrics snapshot.
    let mut snapshots = 0;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::MetricsUpdated(metrics) = event {
            snapshots += 1;
            assert!(metrics.total_workers >= 1);
        }
    }
    assert_eq!(snapshots, 4);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn manual_scaling_is_clamped_to_bounds() {
    let pool = started_pool(&ConfigFileBuilder::new().workers(2, 5).build()).await;

    assert_eq!(pool.scale_workers(10).await.unwrap(), 5);
    assert_eq!(pool.scale_workers(0).await.unwrap(), 2);
    assert_eq!(pool.scale_workers(3).await.unwrap(), 3);

    // Direct additions never exceed max_workers either.
    assert_eq!(pool.add_workers(10, None).await.unwrap(), 2);
    assert_eq!(pool.worker_count(), 5);

    pool.stop().await.unwrap();
    assert!(matches!(
        pool.scale_workers(3).await,
        Err(IngestError::PoolNotRunning)
    ));
}

#[tokio::test]
async fn empty_pool_scales_up_for_a_task_when_allowed() {
    let pool = started_pool(
        &ConfigFileBuilder::new()
            .workers(1, 2)
            .auto_scale(true)
            .scale_check_interval(Duration::from_secs(3600))
            .build(),
    )
    .await;
    pool.register_handler(TaskType::Embedding, RecordingHandler::with_delay(Duration::from_millis(50)));

    let results = with_timeout(pool.execute_tasks(vec![
        task("m1", TaskType::Embedding),
        task("m2", TaskType::Embedding),
    ]))
    .await;
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|r| r.success)));
    assert_eq!(pool.worker_count(), 2);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn timed_out_task_fails_and_its_worker_is_replaced() {
    init_tracing();
    let pool = started_pool(
        &ConfigFileBuilder::new()
            .workers(1, 1)
            .worker_timeout(Duration::from_millis(50))
            .build(),
    )
    .await;
    pool.register_handler(
        TaskType::Parse,
        RecordingHandler::with_delay(Duration::from_millis(500)),
    );
    let before = pool.worker_ids();

    let result = with_timeout(pool.execute_task(task("p1", TaskType::Parse)))
        .await
        .unwrap();

    assert!(!result.success);
    let err = result.error.unwrap();
    assert_eq!(err.code, WorkerError::TIMEOUT);
    assert!(err.retryable);

    let after = pool.worker_ids();
    assert_eq!(after.len(), 1);
    assert_ne!(after, before);
    assert_eq!(pool.worker_status(after[0]), Some(WorkerStatus::Idle));
    assert_eq!(pool.metrics().restarts, 1);

    pool.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_worker_is_restarted_by_the_health_check() {
    init_tracing();
    let pool = started_pool(
        &ConfigFileBuilder::new()
            .workers(2, 2)
            .worker_timeout(Duration::from_millis(50))
            .health_check_interval(Duration::from_secs(3600))
            .build(),
    )
    .await;
    pool.register_handler(
        TaskType::EntityUpsert,
        BlockingHandler::new(Duration::from_millis(400)),
    );

    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_task(task("stuck", TaskType::EntityUpsert)).await })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    let busy: Vec<_> = pool
        .worker_ids()
        .into_iter()
        .filter(|id| pool.worker_status(*id) == Some(WorkerStatus::Busy))
        .collect();
    assert_eq!(busy.len(), 1);

    let report = pool.run_health_check().await;
    assert_eq!(report.restarted.len(), 1);
    let (old, new) = report.restarted[0];
    assert_eq!(old, busy[0]);
    assert_eq!(report.healthy, 1);

    let ids = pool.worker_ids();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&old));
    assert!(ids.contains(&new));
    assert_eq!(pool.worker_status(new), Some(WorkerStatus::Idle));

    // The caller of the stuck task gets a retryable failure once the handler
    // lets go of its thread.
    let result = with_timeout(running).await.unwrap().unwrap();
    assert!(!result.success);
    let err = result.error.unwrap();
    assert_eq!(err.code, WorkerError::STUCK);
    assert!(err.retryable);
    assert_eq!(err.worker_id, Some(old));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn worker_over_error_threshold_is_restarted() {
    let pool = started_pool(
        &ConfigFileBuilder::new()
            .workers(1, 1)
            .restart_threshold(2)
            .build(),
    )
    .await;
    pool.register_handler(TaskType::Embedding, FailingHandler::new());
    let old = pool.worker_ids()[0];

    pool.execute_task(task("m1", TaskType::Embedding)).await.unwrap();
    assert_eq!(pool.worker_status(old), Some(WorkerStatus::Idle));
    pool.execute_task(task("m2", TaskType::Embedding)).await.unwrap();
    assert_eq!(pool.worker_status(old), Some(WorkerStatus::Error));

    let report = pool.run_health_check().await;
    assert_eq!(report.restarted.len(), 1);
    assert_eq!(report.restarted[0].0, old);
    let new = pool.worker_ids()[0];
    assert_ne!(new, old);
    assert_eq!(pool.worker_status(new), Some(WorkerStatus::Idle));

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn in_flight_tasks_fail_when_the_pool_stops() {
    let pool = started_pool(&ConfigFileBuilder::new().workers(1, 1).build()).await;
    pool.register_handler(
        TaskType::Parse,
        RecordingHandler::with_delay(Duration::from_secs(10)),
    );

    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_task(task("p1", TaskType::Parse)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.stop().await.unwrap();

    let result = with_timeout(running).await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, WorkerError::SHUTDOWN);
}

#[tokio::test]
async fn isolated_workers_run_registered_handlers() {
    init_tracing();
    let pool = started_pool(
        &ConfigFileBuilder::new()
            .workers(1, 1)
            .execution(ExecutionMode::Isolated)
            .build(),
    )
    .await;
    let recorder = RecordingHandler::new();
    pool.register_handler(TaskType::EntityUpsert, recorder.clone());
    pool.register_handler(TaskType::Embedding, |t: TaskPayload| async move {
        if t.id == "panic" {
            panic!("embedding model exploded");
        }
        Err::<Value, _>(anyhow!("no model for {}", t.id))
    });

    let ok = with_timeout(pool.execute_task(task("e1", TaskType::EntityUpsert)))
        .await
        .unwrap();
    assert!(ok.success);
    assert_eq!(ok.result, Some(json!({ "id": "e1" })));
    assert_eq!(recorder.seen(), vec!["e1"]);

    let failed = with_timeout(pool.execute_task(task("m1", TaskType::Embedding)))
        .await
        .unwrap();
    assert!(!failed.success);
    assert!(failed.error.unwrap().message.contains("no model for m1"));

    // A handler error leaves the worker thread in place.
    assert_eq!(pool.worker_ids(), vec![ok.worker_id.unwrap()]);

    let panicked = with_timeout(pool.execute_task(task("panic", TaskType::Embedding)))
        .await
        .unwrap();
    assert!(!panicked.success);
    assert!(panicked.error.unwrap().message.contains("embedding model exploded"));

    let again = with_timeout(pool.execute_task(task("e2", TaskType::EntityUpsert)))
        .await
        .unwrap();
    assert!(again.success);

    pool.stop().await.unwrap();
}

#[tokio::test]
async fn handler_panics_restart_the_worker_in_both_execution_modes() {
    init_tracing();
    for mode in [ExecutionMode::InProcess, ExecutionMode::Isolated] {
        let cfg = ConfigFileBuilder::new().workers(1, 1).execution(mode).build();
        let pool = started_pool(&cfg).await;
        pool.register_handler(TaskType::Embedding, |t: TaskPayload| async move {
            if t.id == "panic" {
                panic!("embedding model exploded");
            }
            Ok::<Value, anyhow::Error>(json!({ "id": t.id }))
        });
        let old = pool.worker_ids()[0];

        let result = with_timeout(pool.execute_task(task("panic", TaskType::Embedding)))
            .await
            .unwrap();
        assert!(!result.success, "{mode:?}");
        let err = result.error.unwrap();
        assert_eq!(err.code, WorkerError::CRASHED, "{mode:?}");
        assert!(err.retryable, "{mode:?}");
        assert!(err.message.contains("embedding model exploded"), "{mode:?}");
        assert_eq!(err.worker_id, Some(old), "{mode:?}");

        let ids = pool.worker_ids();
        assert_eq!(ids.len(), 1, "{mode:?}");
        assert_ne!(ids[0], old, "{mode:?}");
        assert_eq!(pool.metrics().restarts, 1, "{mode:?}");

        let next = with_timeout(pool.execute_task(task("m1", TaskType::Embedding)))
            .await
            .unwrap();
        assert!(next.success, "{mode:?}");
        assert_eq!(next.worker_id, Some(ids[0]), "{mode:?}");

        pool.stop().await.unwrap();
    }
}

#[tokio::test]
async fn blocked_isolated_worker_is_replaced_after_timeout() {
    let pool = started_pool(
        &ConfigFileBuilder::new()
            .workers(1, 1)
            .execution(ExecutionMode::Isolated)
            .worker_timeout(Duration::from_millis(100))
            .build(),
    )
    .await;
    pool.register_handler(TaskType::Parse, BlockingHandler::new(Duration::from_millis(600)));
    pool.register_handler(TaskType::EntityUpsert, RecordingHandler::new());
    let old = pool.worker_ids()[0];

    let result = with_timeout(pool.execute_task(task("p1", TaskType::Parse)))
        .await
        .unwrap();
    assert_eq!(result.error.unwrap().code, WorkerError::TIMEOUT);

    let new = pool.worker_ids()[0];
    assert_ne!(new, old);
    let next = with_timeout(pool.execute_task(task("e1", TaskType::EntityUpsert)))
        .await
        .unwrap();
    assert!(next.success);
    assert_eq!(next.worker_id, Some(new));

    pool.stop().await.unwrap();
}

#[derive(Debug, Clone)]
enum ScaleOp {
    Scale(usize),
    Add(usize),
    RemoveIdle(usize),
    Evaluate { depth: usize },
}

fn scale_op() -> impl Strategy<Value = ScaleOp> {
    prop_oneof![
        (0usize..12).prop_map(ScaleOp::Scale),
        (0usize..8).prop_map(ScaleOp::Add),
        (0usize..8).prop_map(ScaleOp::RemoveIdle),
        (0usize..200).prop_map(|depth| ScaleOp::Evaluate { depth }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn worker_count_stays_within_bounds_under_any_scaling_sequence(
        min in 1usize..=3,
        extra in 0usize..=3,
        ops in proptest::collection::vec(scale_op(), 1..30),
    ) {
        let max = min + extra;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let counts = rt.block_on(async {
            let cfg = ConfigFileBuilder::new()
                .workers(min, max)
                .load_estimator(LoadEstimatorKind::QueueDepth)
                .scale_up_above(20.0)
                .health_check_interval(Duration::from_secs(3600))
                .build();
            let (pool, depth) = pool_with_queue_depth(&cfg).await;

            let mut counts = vec![pool.worker_count()];
            for op in &ops {
                match op {
                    ScaleOp::Scale(target) => {
                        let reached = pool.scale_workers(*target).await.unwrap();
                        assert_eq!(reached, (*target).clamp(min, max));
                    }
                    ScaleOp::Add(n) => {
                        pool.add_workers(*n, None).await.unwrap();
                    }
                    ScaleOp::RemoveIdle(n) => {
                        pool.remove_idle_workers(*n).await;
                    }
                    ScaleOp::Evaluate { depth: d } => {
                        depth.store(*d, Ordering::SeqCst);
                        pool.evaluate_scaling().await;
                    }
                }
                counts.push(pool.worker_count());
                assert_eq!(pool.metrics().total_workers, pool.worker_count());
            }
            pool.stop().await.unwrap();
            counts
        });

        for (step, count) in counts.iter().enumerate() {
            prop_assert!(
                (min..=max).contains(count),
                "step {}: {} workers outside {}..={}",
                step,
                count,
                min,
                max
            );
        }
    }
}
