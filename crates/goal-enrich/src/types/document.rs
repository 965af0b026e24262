//! Document, section and sentence types with pipeline checkpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Pipeline checkpoint of a document.
///
/// Replaces the three "structure-parsed / segmented / classified" booleans:
/// a later flag can never be set while an earlier one is clear.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Uploaded,
    StructureParsed,
    Segmented,
    Classified,
}

impl PipelineStage {
    pub fn structure_parsed(&self) -> bool {
        *self >= PipelineStage::StructureParsed
    }

    pub fn segmented(&self) -> bool {
        *self >= PipelineStage::Segmented
    }

    pub fn classified(&self) -> bool {
        *self >= PipelineStage::Classified
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Uploaded => "uploaded",
            PipelineStage::StructureParsed => "structure_parsed",
            PipelineStage::Segmented => "segmented",
            PipelineStage::Classified => "classified",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(PipelineStage::Uploaded),
            "structure_parsed" => Some(PipelineStage::StructureParsed),
            "segmented" => Some(PipelineStage::Segmented),
            "classified" => Some(PipelineStage::Classified),
            _ => None,
        }
    }
}

/// Document processing status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// An uploaded document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub owner: Option<String>,
    /// Original filename as uploaded
    pub filename: String,
    /// SHA-256 of the uploaded bytes (hex)
    pub content_hash: Option<String>,
    /// Location recorded at upload time
    pub storage_path: Option<PathBuf>,
    pub language: Option<String>,
    pub stage: PipelineStage,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: None,
            filename: filename.into(),
            content_hash: None,
            storage_path: None,
            language: None,
            stage: PipelineStage::Uploaded,
            status: DocumentStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// One raw section as returned by the structural parser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSection {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub page: Option<u32>,
}

/// Structural parser output, persisted as the document's structured metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParsedStructure {
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub sections: Vec<RawSection>,
    #[serde(default)]
    pub language: Option<String>,
}

/// A section of a document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: Uuid,
    pub document_id: Uuid,
    pub ordinal: u32,
    pub title: Option<String>,
    pub content: String,
    pub page: Option<u32>,
}

impl Section {
    /// Stable id so a re-run upserts the same row
    pub fn derive_id(document_id: Uuid, ordinal: u32) -> Uuid {
        Uuid::new_v5(&document_id, format!("section:{}", ordinal).as_bytes())
    }
}

/// A sentence within a section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sentence {
    pub id: Uuid,
    pub document_id: Uuid,
    pub section_id: Uuid,
    pub ordinal: u32,
    pub content: String,
    pub label: Option<String>,
    pub rationale: Option<String>,
    pub classification_error: Option<String>,
}

impl Sentence {
    pub fn new(document_id: Uuid, section_id: Uuid, ordinal: u32, content: impl Into<String>) -> Self {
        Self {
            id: Self::derive_id(section_id, ordinal),
            document_id,
            section_id,
            ordinal,
            content: content.into(),
            label: None,
            rationale: None,
            classification_error: None,
        }
    }

    pub fn derive_id(section_id: Uuid, ordinal: u32) -> Uuid {
        Uuid::new_v5(&section_id, format!("sentence:{}", ordinal).as_bytes())
    }

    pub fn is_classified(&self) -> bool {
        self.label.is_some()
    }
}

/// Classifier output for one sentence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub label: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Persisted result of classifying one sentence
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    Labeled(Classification),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentenceClassification {
    pub sentence_id: Uuid,
    pub outcome: ClassificationOutcome,
}
