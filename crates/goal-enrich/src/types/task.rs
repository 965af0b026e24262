//! Task records, payloads and status transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, ErrorKind};

use super::progress::ProgressTracker;

/// Task identifier
pub type TaskId = Uuid;

/// Scheduling priority. Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::InvalidPayload(format!("unknown priority '{}'", other))),
        }
    }
}

/// Task type, the key for handler dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Run every pipeline stage that is not yet done
    ProcessDocument,
    /// Rewind to the segmented checkpoint, then classify and verify again
    Reclassify,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ProcessDocument => "process_document",
            TaskType::Reclassify => "reclassify",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job processing options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    /// Language hint for segmentation (falls back to the document, then config)
    #[serde(default)]
    pub language: Option<String>,
    /// Override of the classification fan-out limit
    #[serde(default)]
    pub classify_concurrency: Option<usize>,
    /// Keep the source artifact after a verified run
    #[serde(default)]
    pub keep_source: bool,
}

/// Payload of a document job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentJob {
    pub document_id: Uuid,
    #[serde(default)]
    pub options: JobOptions,
}

impl DocumentJob {
    pub fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            options: JobOptions::default(),
        }
    }
}

/// Closed set of task payloads, tagged by task type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskPayload {
    ProcessDocument(DocumentJob),
    Reclassify(DocumentJob),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::ProcessDocument(_) => TaskType::ProcessDocument,
            TaskPayload::Reclassify(_) => TaskType::Reclassify,
        }
    }

    /// The entity this task mutates; at most one task per subject is in flight
    pub fn subject(&self) -> Option<String> {
        Some(self.document_job().document_id.to_string())
    }

    pub fn document_job(&self) -> &DocumentJob {
        match self {
            TaskPayload::ProcessDocument(job) | TaskPayload::Reclassify(job) => job,
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses that own their (subject, type) slot for deduplication
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Processing | TaskStatus::Retrying
        )
    }

    /// Legal transitions. `Failed -> Pending` is the manual retry path.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Processing, Cancelled)
                | (Retrying, Pending)
                | (Retrying, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded on a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Submission request
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub payload: TaskPayload,
    pub priority: Priority,
    pub owner: Option<String>,
    pub parent_id: Option<TaskId>,
    /// Falls back to the scheduler default
    pub max_retries: Option<u32>,
    /// Falls back to the scheduler default
    pub timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: Priority::Normal,
            owner: None,
            parent_id: None,
            max_retries: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Full job state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub progress: ProgressTracker,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    /// Correlation ids
    pub owner: Option<String>,
    pub subject: Option<String>,
    pub parent_id: Option<TaskId>,
}

impl TaskRecord {
    pub fn new(request: SubmitRequest, max_retries: u32, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: request.payload.task_type(),
            subject: request.payload.subject(),
            payload: request.payload,
            priority: request.priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            timeout_ms: timeout.as_millis() as u64,
            progress: ProgressTracker::default(),
            result: None,
            error: None,
            owner: request.owner,
            parent_id: request.parent_id,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Key used for the in-flight map; subject-less tasks are keyed by id
    pub fn subject_key(&self) -> String {
        self.subject.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Apply a status change, refusing illegal transitions
    pub fn transition(&mut self, next: TaskStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::internal(format!(
                "Illegal task transition {} -> {} for {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        match next {
            TaskStatus::Processing => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now())
            }
            TaskStatus::Pending | TaskStatus::Retrying => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        let payload = TaskPayload::ProcessDocument(DocumentJob::new(Uuid::new_v4()));
        TaskRecord::new(SubmitRequest::new(payload), 3, Duration::from_secs(60))
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Urgent < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("soon".parse::<Priority>().is_err());
    }

    #[test]
    fn test_payload_is_tagged_by_type() {
        let id = Uuid::new_v4();
        let payload = TaskPayload::Reclassify(DocumentJob::new(id));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "reclassify");
        assert_eq!(value["data"]["document_id"], id.to_string());
        assert_eq!(payload.task_type(), TaskType::Reclassify);
        assert_eq!(payload.subject(), Some(id.to_string()));
    }

    #[test]
    fn test_transitions() {
        let mut task = record();
        assert!(task.transition(TaskStatus::Completed).is_err());
        task.transition(TaskStatus::Processing).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Retrying).unwrap();
        task.transition(TaskStatus::Pending).unwrap();
        task.transition(TaskStatus::Processing).unwrap();
        task.transition(TaskStatus::Cancelled).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.transition(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_cancel_only_from_pending_or_processing() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Retrying.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Cancelled));
    }
}
