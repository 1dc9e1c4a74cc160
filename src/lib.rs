// src/lib.rs

pub mod batch;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod sink;
pub mod types;
pub mod watch;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{load_or_default, ConfigFile};
use crate::engine::{CoreRuntime, EngineEvent, Runtime, RuntimeOptions};
use crate::events::{EventBus, PipelineEvent};
use crate::pool::{QueueDepthEstimator, WorkerPool};
use crate::sink::{register_sink_handlers, MemoryGraphSink};
use crate::types::{ChangeEvent, LoadEstimatorKind};
use crate::watch::{spawn_watcher, ChangeDetector, FileDecomposer, WatchRules};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - worker pool + graph sink handlers
/// - core runtime + async shell
/// - the input: an events file, or an initial scan plus the file watcher
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_or_default(&config_path)
        .with_context(|| format!("loading config from {config_path:?}"))?;

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }

    let options = RuntimeOptions {
        exit_when_drained: args.once,
    };
    let core = CoreRuntime::new(&cfg, options);

    let bus = EventBus::default();
    let mut pool_builder = WorkerPool::builder(cfg.pool.clone())
        .batching(cfg.batching.clone())
        .event_bus(bus.clone());
    if cfg.pool.load_estimator == LoadEstimatorKind::QueueDepth {
        pool_builder = pool_builder
            .load_estimator(Arc::new(QueueDepthEstimator::from_probe(core.queue_probe())));
    }
    let pool = pool_builder.build();

    let sink = Arc::new(MemoryGraphSink::new());
    register_sink_handlers(&pool, sink.clone());
    pool.start().await?;
    spawn_event_logger(&bus);

    let (runtime, tx) = Runtime::new(core, pool.clone(), cfg.batching.clone())?;

    // Ctrl-C → graceful shutdown.
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(EngineEvent::ShutdownRequested).await;
        });
    }

    let decomposer = FileDecomposer::new(args.embed);
    let _watcher = match &args.events {
        Some(path) => {
            let lines = read_events_file(path).await?;
            let once = args.once;
            tokio::spawn(async move {
                for event in lines {
                    if !submit(&tx, &decomposer, event).await {
                        return;
                    }
                }
                if once {
                    let _ = tx.send(EngineEvent::InputClosed).await;
                }
            });
            None
        }
        None => {
            let root = PathBuf::from(&cfg.watch.root);
            let root = root.canonicalize().unwrap_or(root);
            let mut detector = ChangeDetector::new(root, WatchRules::from_config(&cfg.watch)?);
            let initial = detector.scan()?;
            info!(files = initial.len(), root = ?detector.root(), "initial scan complete");

            let watcher = if args.once {
                None
            } else {
                let (change_tx, change_rx) = mpsc::channel::<ChangeEvent>(256);
                let handle = spawn_watcher(&cfg.watch, change_tx)?;
                Some((handle, change_rx))
            };

            let (handle, change_rx) = match watcher {
                Some((handle, rx)) => (Some(handle), Some(rx)),
                None => (None, None),
            };

            let once = args.once;
            tokio::spawn(async move {
                for event in initial {
                    if !submit(&tx, &decomposer, event).await {
                        return;
                    }
                }
                if once {
                    let _ = tx.send(EngineEvent::InputClosed).await;
                    return;
                }
                if let Some(mut rx) = change_rx {
                    while let Some(event) = rx.recv().await {
                        if !submit(&tx, &decomposer, event).await {
                            return;
                        }
                    }
                }
            });
            handle
        }
    };

    let core = runtime.run().await?;
    pool.stop().await?;

    let stats = core.stats();
    info!(
        events = stats.events_accepted,
        rejected = stats.events_rejected,
        completed = stats.tasks_completed,
        failed = stats.tasks_failed,
        retried = stats.tasks_retried,
        entities = sink.entity_count(),
        relationships = sink.relationship_count(),
        "ingestflow finished"
    );
    Ok(())
}

/// Decompose `event` and submit it. Returns false once the engine is gone.
async fn submit(tx: &mpsc::Sender<EngineEvent>, decomposer: &FileDecomposer, event: ChangeEvent) -> bool {
    let fragments = decomposer.decompose(&event);
    debug!(event_id = %event.id, file = %event.file_path, fragments = fragments.len(), "submitting change event");
    tx.send(EngineEvent::Submit { event, fragments }).await.is_ok()
}

/// Parse a newline-delimited JSON file of change events. Blank lines are
/// skipped; a malformed line is an error naming its line number.
async fn read_events_file(path: &Path) -> Result<Vec<ChangeEvent>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening events file {path:?}"))?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    let mut events = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: ChangeEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{line_no}: invalid change event", path.display()))?;
        events.push(event);
    }
    info!(events = events.len(), ?path, "loaded change events");
    Ok(events)
}

/// Log pipeline events at debug level, and failures at warn.
fn spawn_event_logger(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::CyclesDetected(groups)) => {
                    warn!(cycles = ?groups, "dependency cycles will not be ingested");
                }
                Ok(PipelineEvent::QueueOverflow { max_size }) => {
                    warn!(max_size, "ingestion backlog overflow");
                }
                Ok(event) => debug!(topic = event.topic(), "pipeline event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Print the effective configuration as TOML.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    println!("ingestflow dry-run");
    println!();
    let rendered = toml::to_string_pretty(cfg).context("rendering effective config")?;
    println!("{rendered}");
    debug!("dry-run complete (no execution)");
    Ok(())
}
