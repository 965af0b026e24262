//! Task handlers and the registry that dispatches to them

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::types::{ProgressTracker, TaskId, TaskPayload, TaskRecord, TaskType};

/// Handler for one task type.
///
/// Handlers may run more than once for the same task id (retries, restarts)
/// and must skip work that an earlier run already persisted.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value>;

    /// Called after `handle` was dropped for exceeding the task timeout
    async fn on_timeout(&self, _ctx: &TaskContext, _error: &Error) {}
}

/// What a running handler sees of its task
pub struct TaskContext {
    task: TaskRecord,
    scheduler: Arc<Scheduler>,
}

impl TaskContext {
    pub fn new(task: TaskRecord, scheduler: Arc<Scheduler>) -> Self {
        Self { task, scheduler }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Snapshot taken when the task was dequeued
    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.task.payload
    }

    pub fn retry_count(&self) -> u32 {
        self.task.retry_count
    }

    /// No automatic retry follows a failure of this run
    pub fn is_final_attempt(&self) -> bool {
        !self.task.has_retry_budget()
    }

    /// Cooperative cancellation check
    pub fn is_cancelled(&self) -> bool {
        self.scheduler.is_cancelled(&self.task.id)
    }

    pub fn report_progress(&self, progress: ProgressTracker) {
        self.scheduler.update_progress(&self.task.id, progress);
    }
}

/// Task type -> handler. Built once at startup, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a second handler for the same type is an error
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if self.handlers.contains_key(&task_type) {
            return Err(Error::DuplicateHandler(task_type.to_string()));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(&self, _ctx: &TaskContext) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(TaskType::ProcessDocument, Arc::new(NoopHandler))
            .unwrap();

        assert!(registry.get(&TaskType::ProcessDocument).is_some());
        assert!(registry.get(&TaskType::Reclassify).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(TaskType::Reclassify, Arc::new(NoopHandler))
            .unwrap();
        let err = registry
            .register(TaskType::Reclassify, Arc::new(NoopHandler))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(_)));
    }
}
