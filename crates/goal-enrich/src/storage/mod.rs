//! Storage port for documents and their derived rows
//!
//! Provides an in-memory store for tests and a SQLite store that also
//! journals task records.

mod database;
mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    Document, DocumentStatus, ParsedStructure, PipelineStage, Section, Sentence,
    SentenceClassification,
};

pub use database::SqliteStore;
pub use memory::MemoryStore;

/// Count-by-predicate queries over one document's rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountQuery {
    Sections,
    Sentences,
    /// Sentences whose section row does not exist
    OrphanSentences,
    /// Sections with blank content
    EmptySections,
    /// Sentences with blank content
    EmptySentences,
    /// Sentences carrying a label
    ClassifiedSentences,
}

/// Transactional document storage
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>>;

    /// Insert or replace a document row
    async fn put_document(&self, document: &Document) -> Result<()>;

    /// Advance the checkpoint. Setting a stage already reached is a no-op;
    /// skipping a stage is an error.
    async fn set_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()>;

    /// Move the checkpoint back and drop what later stages produced
    async fn rewind_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()>;

    async fn set_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// Persist structured metadata
    async fn save_structure(&self, document_id: Uuid, structure: &ParsedStructure) -> Result<()>;

    /// Raw serialized structured metadata, if any
    async fn load_structure(&self, document_id: Uuid) -> Result<Option<String>>;

    /// Insert or update by id, in one transaction
    async fn upsert_sections(&self, sections: &[Section]) -> Result<()>;

    /// Insert or update by id, in one transaction
    async fn upsert_sentences(&self, sentences: &[Sentence]) -> Result<()>;

    /// Sentences of a document in section then sentence order
    async fn list_sentences(&self, document_id: Uuid) -> Result<Vec<Sentence>>;

    /// Store labels or per-sentence errors
    async fn save_classifications(&self, results: &[SentenceClassification]) -> Result<()>;

    async fn count(&self, document_id: Uuid, query: CountQuery) -> Result<usize>;
}

/// Whether a stage may be set given the current one
pub(crate) fn check_advance(
    document_id: Uuid,
    current: PipelineStage,
    next: PipelineStage,
) -> Result<bool> {
    if current >= next {
        return Ok(false);
    }
    let expected = match next {
        PipelineStage::Uploaded => PipelineStage::Uploaded,
        PipelineStage::StructureParsed => PipelineStage::Uploaded,
        PipelineStage::Segmented => PipelineStage::StructureParsed,
        PipelineStage::Classified => PipelineStage::Segmented,
    };
    if current != expected {
        return Err(crate::error::Error::storage(format!(
            "Document {} cannot move from {} to {}",
            document_id,
            current.as_str(),
            next.as_str()
        )));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_advance() {
        let id = Uuid::new_v4();
        assert!(check_advance(id, PipelineStage::Uploaded, PipelineStage::StructureParsed).unwrap());
        assert!(!check_advance(id, PipelineStage::Classified, PipelineStage::Segmented).unwrap());
        assert!(check_advance(id, PipelineStage::Uploaded, PipelineStage::Segmented).is_err());
    }
}
