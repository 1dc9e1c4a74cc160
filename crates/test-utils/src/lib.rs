pub mod builders;
pub mod handlers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tracing_subscriber::{fmt, EnvFilter};

use ingestflow::config::ConfigFile;
use ingestflow::pool::{QueueDepthEstimator, WorkerPool};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Pool built from the `[pool]` and `[batching]` tables of `cfg`, not started.
pub fn pool_for(cfg: &ConfigFile) -> WorkerPool {
    WorkerPool::builder(cfg.pool.clone())
        .batching(cfg.batching.clone())
        .build()
}

/// Same as [`pool_for`], already started.
pub async fn started_pool(cfg: &ConfigFile) -> WorkerPool {
    let pool = pool_for(cfg);
    pool.start()
        .await
        .expect("worker pool failed to start");
    pool
}

/// Started pool whose load estimate is whatever the test stores in the
/// returned counter.
pub async fn pool_with_queue_depth(cfg: &ConfigFile) -> (WorkerPool, Arc<AtomicUsize>) {
    let depth = Arc::new(AtomicUsize::new(0));
    let reading = depth.clone();
    let pool = WorkerPool::builder(cfg.pool.clone())
        .batching(cfg.batching.clone())
        .load_estimator(Arc::new(QueueDepthEstimator::new(move || {
            reading.load(Ordering::SeqCst)
        })))
        .build();
    pool.start()
        .await
        .expect("worker pool failed to start");
    (pool, depth)
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}
