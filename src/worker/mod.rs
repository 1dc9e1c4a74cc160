// src/worker/mod.rs

//! Task execution.
//!
//! - [`handler`] holds the [`TaskHandler`] trait and the shared registry.
//! - [`strategy`] selects in-process or isolated execution per worker.
//! - [`isolated`] implements the message protocol of isolated workers.
//! - [`instance`] models one pool-owned worker and its result type.

use std::any::Any;

pub mod handler;
pub mod instance;
pub mod isolated;
pub mod strategy;

pub use handler::{HandlerRegistry, TaskHandler};
pub use instance::{WorkerConfig, WorkerInstance, WorkerMetrics, WorkerResult, WorkerStatus};
pub use isolated::{IsolatedHandle, WorkerMessage, WorkerReply};
pub use strategy::ExecutionStrategy;

pub type WorkerId = uuid::Uuid;

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
