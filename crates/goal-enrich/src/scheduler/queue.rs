//! Priority task queue with deduplication and an in-flight map
//!
//! All state lives behind one mutex. Every operation takes the lock once,
//! mutates, clones what it needs and releases before persisting.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::types::{
    ProgressTracker, SubmitRequest, TaskError, TaskId, TaskRecord, TaskStatus, TaskType,
};

use super::journal::TaskJournal;

/// Queue ordering key: priority class first, then submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: crate::types::Priority,
    seq: u64,
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_flight: usize,
    pub total: usize,
}

#[derive(Default)]
struct SchedulerState {
    /// All known tasks (single source of truth)
    tasks: HashMap<TaskId, TaskRecord>,
    /// Pending tasks in dequeue order
    queue: BTreeMap<QueueKey, TaskId>,
    queue_keys: HashMap<TaskId, QueueKey>,
    /// Subject key -> task currently owning it
    in_flight: HashMap<String, TaskId>,
    /// (subject, type) -> active task, for idempotent submission
    active: HashMap<(String, TaskType), TaskId>,
    next_seq: u64,
}

impl SchedulerState {
    fn enqueue(&mut self, task_id: TaskId, priority: crate::types::Priority) {
        let key = QueueKey {
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(key, task_id);
        self.queue_keys.insert(task_id, key);
    }

    fn dequeue(&mut self, task_id: &TaskId) {
        if let Some(key) = self.queue_keys.remove(task_id) {
            self.queue.remove(&key);
        }
    }

    /// First queued task whose subject is not already in flight
    fn next_ready(&self) -> Option<TaskId> {
        self.queue
            .values()
            .find(|id| {
                self.tasks
                    .get(*id)
                    .map(|task| !self.in_flight.contains_key(&task.subject_key()))
                    .unwrap_or(false)
            })
            .copied()
    }

    fn claim_subject(&mut self, task: &TaskRecord) {
        if let Some(subject) = &task.subject {
            self.active.insert((subject.clone(), task.task_type), task.id);
        }
    }

    fn release_subject(&mut self, task: &TaskRecord) {
        if let Some(subject) = &task.subject {
            let key = (subject.clone(), task.task_type);
            if self.active.get(&key) == Some(&task.id) {
                self.active.remove(&key);
            }
        }
    }

    fn release_in_flight(&mut self, task: &TaskRecord) {
        let key = task.subject_key();
        if self.in_flight.get(&key) == Some(&task.id) {
            self.in_flight.remove(&key);
        }
    }
}

/// Priority scheduler
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    journal: Option<Arc<dyn TaskJournal>>,
}

impl Scheduler {
    /// Create an in-memory scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            config,
            journal: None,
        }
    }

    /// Create a scheduler that persists every transition
    pub fn with_journal(config: SchedulerConfig, journal: Arc<dyn TaskJournal>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            config,
            journal: Some(journal),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit a task. Returns the id of an existing active task for the same
    /// (subject, type) instead of creating a duplicate.
    pub fn submit(&self, request: SubmitRequest) -> TaskId {
        let task_type = request.payload.task_type();
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(subject) = request.payload.subject() {
                if let Some(existing) = state.active.get(&(subject.clone(), task_type)) {
                    tracing::debug!(
                        "Task {} already active for {} ({}), not creating a duplicate",
                        existing,
                        subject,
                        task_type
                    );
                    return *existing;
                }
            }

            let max_retries = request
                .max_retries
                .unwrap_or(self.config.default_max_retries);
            let timeout = request
                .timeout
                .unwrap_or_else(|| self.config.default_timeout());
            let record = TaskRecord::new(request, max_retries, timeout);

            state.claim_subject(&record);
            state.enqueue(record.id, record.priority);
            state.tasks.insert(record.id, record.clone());
            record
        };

        tracing::info!(
            "Submitted task {} ({}, priority {}, subject {:?})",
            record.id,
            record.task_type,
            record.priority,
            record.subject
        );
        self.persist(&record);
        record.id
    }

    /// Pop the most urgent runnable task and mark it PROCESSING
    pub fn next(&self) -> Option<TaskRecord> {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let task_id = state.next_ready()?;
            state.dequeue(&task_id);

            let task = state.tasks.get_mut(&task_id)?;
            if let Err(e) = task.transition(TaskStatus::Processing) {
                tracing::error!("Dropping unrunnable task from queue: {}", e);
                return None;
            }
            let record = task.clone();
            state.in_flight.insert(record.subject_key(), task_id);
            record
        };

        self.persist(&record);
        Some(record)
    }

    /// Cancel a task. PENDING tasks leave the queue immediately; PROCESSING
    /// tasks are flagged and the handler observes it cooperatively.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            let was = task.status;
            if task.transition(TaskStatus::Cancelled).is_err() {
                return false;
            }
            let record = task.clone();
            if was == TaskStatus::Pending {
                state.dequeue(task_id);
            }
            state.release_subject(&record);
            record
        };

        tracing::info!("Cancelled task {} ({})", record.id, record.task_type);
        self.persist(&record);
        true
    }

    /// Manually re-enqueue a FAILED task that still has retry budget and did
    /// not fail permanently
    pub fn retry(&self, task_id: &TaskId) -> bool {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get(task_id) else {
                return false;
            };
            if task.status != TaskStatus::Failed {
                return false;
            }
            if !task.has_retry_budget() {
                tracing::info!(
                    "Refusing retry of {}: budget exhausted ({}/{})",
                    task_id,
                    task.retry_count,
                    task.max_retries
                );
                return false;
            }
            if let Some(error) = &task.error {
                if error.is_permanent() || self.config.permanent_error_codes.contains(&error.code) {
                    tracing::info!(
                        "Refusing retry of {}: permanent error '{}'",
                        task_id,
                        error.code
                    );
                    return false;
                }
            }
            if let Some(subject) = &task.subject {
                if state.active.contains_key(&(subject.clone(), task.task_type)) {
                    tracing::info!(
                        "Refusing retry of {}: another task is active for {}",
                        task_id,
                        subject
                    );
                    return false;
                }
            }

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.transition(TaskStatus::Pending).is_err() {
                return false;
            }
            task.retry_count += 1;
            task.progress.reset();
            task.error = None;
            task.result = None;
            task.started_at = None;
            task.completed_at = None;
            let record = task.clone();

            state.claim_subject(&record);
            state.enqueue(record.id, record.priority);
            record
        };

        tracing::info!(
            "Manually re-enqueued task {} (retry {}/{})",
            record.id,
            record.retry_count,
            record.max_retries
        );
        self.persist(&record);
        true
    }

    /// Counts by state
    pub fn status(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            in_flight: state.in_flight.len(),
            total: state.tasks.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.queued += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Retrying => stats.retrying += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Snapshot of one task
    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    /// Whether a cancel was requested for the task
    pub fn is_cancelled(&self, task_id: &TaskId) -> bool {
        self.state
            .lock()
            .tasks
            .get(task_id)
            .map(|task| task.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Replace the progress of a running task
    pub fn update_progress(&self, task_id: &TaskId, progress: ProgressTracker) {
        let mut state = self.state.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.status == TaskStatus::Processing {
                task.progress = progress;
            }
        }
        // Progress is not journaled; it is rebuilt on the next attempt.
    }

    /// Record a successful handler run
    pub fn complete(&self, task_id: &TaskId, result: serde_json::Value) {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            task.result = Some(result);
            if task.status == TaskStatus::Cancelled {
                tracing::info!("Task {} finished after cancellation; keeping it cancelled", task_id);
            } else if let Err(e) = task.transition(TaskStatus::Completed) {
                tracing::error!("{}", e);
                return;
            } else {
                task.progress.complete();
                task.error = None;
            }
            let record = task.clone();
            state.release_in_flight(&record);
            state.release_subject(&record);
            record
        };

        self.persist(&record);
    }

    /// Record a terminal failure
    pub fn fail(&self, task_id: &TaskId, error: &Error) {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get_mut(task_id) else {
                return;
            };
            task.error = Some(TaskError::from(error));
            if task.status != TaskStatus::Cancelled {
                if let Err(e) = task.transition(TaskStatus::Failed) {
                    tracing::error!("{}", e);
                    return;
                }
            }
            let record = task.clone();
            state.release_in_flight(&record);
            state.release_subject(&record);
            record
        };

        self.persist(&record);
    }

    /// Mark a failed attempt as waiting for backoff. The task keeps its
    /// in-flight slot. Returns the retry count used for the backoff delay.
    pub fn begin_retry(&self, task_id: &TaskId, error: &Error) -> Option<u32> {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let task = state.tasks.get_mut(task_id)?;
            if task.transition(TaskStatus::Retrying).is_err() {
                // cancelled after the handler returned
                if task.status == TaskStatus::Cancelled {
                    let record = task.clone();
                    state.release_in_flight(&record);
                }
                return None;
            }
            task.error = Some(TaskError::from(error));
            task.clone()
        };

        self.persist(&record);
        Some(record.retry_count)
    }

    /// Put a RETRYING task back in the queue under the same id
    pub fn requeue(&self, task_id: &TaskId) -> bool {
        let record = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if task.transition(TaskStatus::Pending).is_err() {
                return false;
            }
            task.retry_count += 1;
            task.progress.reset();
            task.started_at = None;
            let record = task.clone();

            state.release_in_flight(&record);
            state.enqueue(record.id, record.priority);
            record
        };

        self.persist(&record);
        true
    }

    /// Release the in-flight slot of a task that was cancelled while running
    pub fn finish_cancelled(&self, task_id: &TaskId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(task) = state.tasks.get(task_id) {
            let record = task.clone();
            state.release_in_flight(&record);
        }
    }

    /// Drop terminal tasks older than the retention window
    pub fn reap(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(3650));

        let reaped: Vec<TaskId> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let expired: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|task| task.status.is_terminal())
                .filter(|task| task.completed_at.map(|at| at < cutoff).unwrap_or(false))
                .filter(|task| state.in_flight.get(&task.subject_key()) != Some(&task.id))
                .map(|task| task.id)
                .collect();

            for id in &expired {
                state.tasks.remove(id);
            }
            expired
        };

        if let Some(journal) = &self.journal {
            for id in &reaped {
                if let Err(e) = off_async_thread(|| journal.remove_task(id)) {
                    tracing::error!("Failed to remove reaped task {}: {}", id, e);
                }
            }
        }
        if !reaped.is_empty() {
            tracing::info!("Reaped {} finished tasks", reaped.len());
        }
        reaped.len()
    }

    /// Rebuild state from persisted records. Unfinished tasks (including those
    /// interrupted mid-run) go back to PENDING.
    pub fn restore(&self, records: Vec<TaskRecord>) -> usize {
        let mut requeued = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for mut record in records {
                if record.status.is_active() {
                    if let Some(subject) = &record.subject {
                        if state.active.contains_key(&(subject.clone(), record.task_type)) {
                            tracing::warn!(
                                "Skipping duplicate unfinished task {} for {}",
                                record.id,
                                subject
                            );
                            continue;
                        }
                    }
                    record.status = TaskStatus::Pending;
                    record.started_at = None;
                    record.progress.reset();
                    state.claim_subject(&record);
                    state.enqueue(record.id, record.priority);
                    requeued.push(record.clone());
                }
                state.tasks.insert(record.id, record);
            }
        }

        for record in &requeued {
            self.persist(record);
        }
        if !requeued.is_empty() {
            tracing::info!("Restored {} unfinished tasks", requeued.len());
        }
        requeued.len()
    }

    fn persist(&self, record: &TaskRecord) {
        if let Some(journal) = &self.journal {
            if let Err(e) = off_async_thread(|| journal.save_task(record)) {
                tracing::error!("Failed to persist task {}: {}", record.id, e);
            }
        }
    }
}

/// Run a blocking journal call. On a multi-thread runtime the worker thread
/// is handed to the blocking pool for the duration of the call.
fn off_async_thread<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
