//! Job submission and status contract for callers (API layer, CLI)

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EnrichConfig;
use crate::error::Result;
use crate::pipeline::PipelineOrchestrator;
use crate::processing::{HandlerRegistry, WorkerPool};
use crate::providers::Collaborators;
use crate::scheduler::{QueueStats, Scheduler, TaskJournal};
use crate::storage::DocumentStore;
use crate::types::{
    DocumentJob, JobOptions, Priority, ProgressTracker, SubmitRequest, TaskError, TaskId,
    TaskPayload, TaskRecord, TaskStatus, TaskType,
};

/// What a caller sees of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: TaskId,
    pub task_type: TaskType,
    pub document_id: Uuid,
    pub status: TaskStatus,
    pub priority: Priority,
    pub progress: ProgressTracker,
    pub percentage: f32,
    pub error: Option<TaskError>,
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// The worker pool will run it again without caller action
    pub will_retry: bool,
    /// `retry_job` would be accepted
    pub can_retry: bool,
    /// Failed for good; someone has to fix the input (e.g. re-upload)
    pub needs_intervention: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    fn from_record(record: TaskRecord, permanent_codes: &[String]) -> Self {
        let will_retry = record.status == TaskStatus::Retrying
            || (record.status == TaskStatus::Pending && record.retry_count > 0);

        let permanent = record
            .error
            .as_ref()
            .map(|e| e.is_permanent() || permanent_codes.contains(&e.code))
            .unwrap_or(false);
        let can_retry =
            record.status == TaskStatus::Failed && record.has_retry_budget() && !permanent;
        let needs_intervention = record.status == TaskStatus::Failed && !can_retry;

        Self {
            id: record.id,
            task_type: record.task_type,
            document_id: record.payload.document_job().document_id,
            status: record.status,
            priority: record.priority,
            percentage: record.progress.percentage(),
            progress: record.progress,
            error: record.error,
            result: record.result,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            will_retry,
            can_retry,
            needs_intervention,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

/// Scheduler, handler registry and worker pool behind one facade
pub struct JobService {
    scheduler: Arc<Scheduler>,
    registry: Arc<HandlerRegistry>,
    config: EnrichConfig,
    pool: Mutex<Option<WorkerPool>>,
}

impl JobService {
    pub fn new(scheduler: Arc<Scheduler>, registry: Arc<HandlerRegistry>, config: EnrichConfig) -> Self {
        Self {
            scheduler,
            registry,
            config,
            pool: Mutex::new(None),
        }
    }

    /// Wire the document pipeline for both task types. With a journal every
    /// transition is persisted.
    pub fn with_pipeline(
        config: EnrichConfig,
        store: Arc<dyn DocumentStore>,
        collaborators: Collaborators,
        journal: Option<Arc<dyn TaskJournal>>,
    ) -> Result<Self> {
        let scheduler = match journal {
            Some(journal) => Scheduler::with_journal(config.scheduler.clone(), journal),
            None => Scheduler::new(config.scheduler.clone()),
        };

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store,
            collaborators,
            config.pipeline.clone(),
            config.verifier.clone(),
        ));
        let mut registry = HandlerRegistry::new();
        for task_type in PipelineOrchestrator::task_types() {
            registry.register(task_type, orchestrator.clone())?;
        }

        Ok(Self::new(Arc::new(scheduler), Arc::new(registry), config))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Re-enqueue unfinished jobs recorded before a restart
    pub fn restore(&self, journal: &dyn TaskJournal) -> Result<usize> {
        let records = journal.load_tasks()?;
        Ok(self.scheduler.restore(records))
    }

    /// Spawn the worker pool. Calling it twice has no effect.
    pub fn start(&self) {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return;
        }
        *pool = Some(WorkerPool::spawn(
            self.scheduler.clone(),
            self.registry.clone(),
            &self.config.workers,
        ));
    }

    /// Stop the pool and wait for running handlers to finish
    pub async fn shutdown(&self) {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown_and_join().await;
        }
    }

    /// Queue a document for every pipeline stage it has not finished
    pub fn submit_document_job(
        &self,
        document_id: Uuid,
        priority: Priority,
        options: JobOptions,
    ) -> TaskId {
        let payload = TaskPayload::ProcessDocument(DocumentJob {
            document_id,
            options,
        });
        self.scheduler
            .submit(SubmitRequest::new(payload).with_priority(priority))
    }

    /// Queue a fresh classification pass over an already segmented document
    pub fn submit_reclassify(
        &self,
        document_id: Uuid,
        priority: Priority,
        options: JobOptions,
    ) -> TaskId {
        let payload = TaskPayload::Reclassify(DocumentJob {
            document_id,
            options,
        });
        self.scheduler
            .submit(SubmitRequest::new(payload).with_priority(priority))
    }

    /// Submit with full control over owner, parent and limits
    pub fn submit(&self, request: SubmitRequest) -> TaskId {
        self.scheduler.submit(request)
    }

    pub fn get_job(&self, job_id: &TaskId) -> Option<JobView> {
        self.scheduler
            .get(job_id)
            .map(|record| JobView::from_record(record, &self.config.scheduler.permanent_error_codes))
    }

    pub fn cancel_job(&self, job_id: &TaskId) -> bool {
        self.scheduler.cancel(job_id)
    }

    pub fn retry_job(&self, job_id: &TaskId) -> bool {
        self.scheduler.retry(job_id)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.scheduler.status()
    }
}
