// src/worker/handler.rs

//! Task handlers and the registry workers look them up in.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::types::{TaskPayload, TaskType};

/// Executes one task type.
///
/// Handlers must be idempotent by the task's natural key: a timed-out task
/// may still have applied its side effects and will be executed again.
pub trait TaskHandler: Send + Sync {
    fn handle(
        &self,
        task: TaskPayload,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + '_>>;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskPayload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn handle(
        &self,
        task: TaskPayload,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + '_>> {
        Box::pin(self(task))
    }
}

/// Handlers by task type, shared by the pool and every worker it creates.
///
/// Registration after workers exist is visible to them immediately.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task_type`.
    pub fn insert(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.get(task_type).is_some()
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut types: Vec<TaskType> = handlers.keys().copied().collect();
        types.sort();
        types
    }
}
