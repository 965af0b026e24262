//! goal-enrich: Resumable document enrichment jobs
//!
//! A priority scheduler and worker pool drive a checkpointed pipeline
//! (structural parsing, segmentation, sentence classification) and verify the
//! persisted result before a document is marked complete. The parser,
//! segmenter, classifier and storage engine are external collaborators
//! reached through traits.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod providers;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod types;

pub use config::EnrichConfig;
pub use error::{Error, ErrorKind, Result};
pub use scheduler::{QueueStats, Scheduler};
pub use service::{JobService, JobView};
pub use types::{
    document::{Document, DocumentStatus, PipelineStage},
    task::{JobOptions, Priority, TaskId, TaskStatus, TaskType},
};
