//! Error types for the enrichment pipeline
//!
//! Every error is classified as permanent or transient. The worker pool uses
//! the classification to gate automatic retries and the scheduler uses the
//! stable error code to refuse manual retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for enrichment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Retry classification of an error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retrying cannot change the outcome
    Permanent,
    /// May succeed on retry (external unavailability, timing)
    Transient,
}

/// Enrichment pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No candidate location holds the document's source file
    #[error("Source artifact for document {document_id} not found (tried: {tried})")]
    SourceMissing { document_id: Uuid, tried: String },

    /// Task payload could not be interpreted
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Document row does not exist
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// No handler registered for a task type
    #[error("No handler registered for task type '{0}'")]
    HandlerNotFound(String),

    /// A handler is already registered for a task type
    #[error("Duplicate handler for task type '{0}'")]
    DuplicateHandler(String),

    /// Structural parser refused the file; resubmitting the same bytes cannot help
    #[error("Structural parser rejected '{filename}': {message}")]
    ParserRejected { filename: String, message: String },

    /// Collaborator call failed (parser, segmenter, classifier)
    #[error("{collaborator} call failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// Segmentation produced (or persisted) nothing
    #[error("Segmentation produced {sections} sections and {sentences} sentences for document {document_id}")]
    EmptySegmentation {
        document_id: Uuid,
        sections: usize,
        sentences: usize,
    },

    /// Classifier refused or could not label one sentence; affects only that sentence
    #[error("Classifier rejected sentence: {0}")]
    ClassificationRejected(String),

    /// Too many per-sentence classification failures in one pass
    #[error("Classifier unavailable: {failed}/{total} sentences failed")]
    ClassifierUnavailable { failed: usize, total: usize },

    /// Persisted state did not pass the consistency checks
    #[error("Verification failed for document {document_id}: {reason}")]
    Verification { document_id: Uuid, reason: String },

    /// Handler exceeded the task timeout
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// Handler observed a cancellation request
    #[error("Task cancelled")]
    Cancelled,

    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a collaborator error
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Create a verification error
    pub fn verification(document_id: Uuid, reason: impl Into<String>) -> Self {
        Self::Verification {
            document_id,
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Retry classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::SourceMissing { .. }
            | Error::InvalidPayload(_)
            | Error::DocumentNotFound(_)
            | Error::HandlerNotFound(_)
            | Error::DuplicateHandler(_)
            | Error::ParserRejected { .. }
            | Error::ClassificationRejected(_)
            | Error::Cancelled => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        }
    }

    /// Whether retrying is pointless
    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }

    /// Stable machine-readable code, used by the manual-retry deny-list
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::SourceMissing { .. } => "source_missing",
            Error::InvalidPayload(_) => "invalid_payload",
            Error::DocumentNotFound(_) => "document_not_found",
            Error::HandlerNotFound(_) => "handler_not_found",
            Error::DuplicateHandler(_) => "duplicate_handler",
            Error::ParserRejected { .. } => "parser_rejected",
            Error::Collaborator { .. } => "collaborator",
            Error::ClassificationRejected(_) => "classification_rejected",
            Error::EmptySegmentation { .. } => "empty_segmentation",
            Error::ClassifierUnavailable { .. } => "classifier_unavailable",
            Error::Verification { .. } => "verification_failed",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::Storage(_) | Error::Database(_) => "storage",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Http(_) => "http",
            Error::Internal(_) => "internal",
        }
    }
}
