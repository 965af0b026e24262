//! Shared types for tasks, progress and documents

pub mod document;
pub mod progress;
pub mod task;

pub use document::{
    Classification, ClassificationOutcome, Document, DocumentStatus, ParsedStructure,
    PipelineStage, RawSection, Section, Sentence, SentenceClassification,
};
pub use progress::ProgressTracker;
pub use task::{
    DocumentJob, JobOptions, Priority, SubmitRequest, TaskError, TaskId, TaskPayload, TaskRecord,
    TaskStatus, TaskType,
};
