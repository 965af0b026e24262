//! Persistence port for task records
//!
//! The scheduler writes every transition through this trait so a restart can
//! rebuild the queue. Implementations are synchronous, like the SQLite store.

use crate::error::Result;
use crate::types::{TaskId, TaskRecord};

/// Durable record of task state
pub trait TaskJournal: Send + Sync {
    /// Insert or replace a task record
    fn save_task(&self, record: &TaskRecord) -> Result<()>;

    /// Forget a reaped task
    fn remove_task(&self, task_id: &TaskId) -> Result<()>;

    /// Every persisted task, oldest first
    fn load_tasks(&self) -> Result<Vec<TaskRecord>>;
}
