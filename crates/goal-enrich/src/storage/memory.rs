//! In-memory store used by tests and single-shot runs

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::scheduler::TaskJournal;
use crate::types::{
    ClassificationOutcome, Document, DocumentStatus, ParsedStructure, PipelineStage, Section,
    Sentence, SentenceClassification, TaskId, TaskRecord,
};

use super::{check_advance, CountQuery, DocumentStore};

#[derive(Default)]
struct DocumentRows {
    sections: BTreeMap<Uuid, Section>,
    sentences: BTreeMap<Uuid, Sentence>,
}

/// Store backed by maps
#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<Uuid, Document>,
    structures: DashMap<Uuid, String>,
    rows: RwLock<HashMap<Uuid, DocumentRows>>,
    tasks: DashMap<TaskId, TaskRecord>,
    drop_segment_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept section and sentence writes without storing them, as a backend
    /// with delayed visibility would
    pub fn drop_segment_writes(&self, drop: bool) {
        self.drop_segment_writes.store(drop, Ordering::SeqCst);
    }

    fn with_document<T>(&self, document_id: Uuid, f: impl FnOnce(&mut Document) -> T) -> Result<T> {
        let mut document = self
            .documents
            .get_mut(&document_id)
            .ok_or(Error::DocumentNotFound(document_id))?;
        let out = f(&mut document);
        document.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.get(&document_id).map(|d| d.clone()))
    }

    async fn put_document(&self, document: &Document) -> Result<()> {
        self.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn set_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()> {
        self.with_document(document_id, |document| -> Result<()> {
            if check_advance(document_id, document.stage, stage)? {
                document.stage = stage;
            }
            Ok(())
        })?
    }

    async fn rewind_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()> {
        self.with_document(document_id, |document| {
            if document.stage > stage {
                document.stage = stage;
            }
        })?;

        if stage < PipelineStage::StructureParsed {
            self.structures.remove(&document_id);
        }
        let mut rows = self.rows.write();
        if let Some(rows) = rows.get_mut(&document_id) {
            if stage < PipelineStage::Segmented {
                rows.sections.clear();
                rows.sentences.clear();
            } else if stage < PipelineStage::Classified {
                for sentence in rows.sentences.values_mut() {
                    sentence.label = None;
                    sentence.rationale = None;
                    sentence.classification_error = None;
                }
            }
        }
        Ok(())
    }

    async fn set_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.with_document(document_id, |document| {
            document.status = status;
            document.error = error;
        })
    }

    async fn save_structure(&self, document_id: Uuid, structure: &ParsedStructure) -> Result<()> {
        let json = serde_json::to_string(structure)?;
        self.structures.insert(document_id, json);
        Ok(())
    }

    async fn load_structure(&self, document_id: Uuid) -> Result<Option<String>> {
        Ok(self.structures.get(&document_id).map(|s| s.clone()))
    }

    async fn upsert_sections(&self, sections: &[Section]) -> Result<()> {
        if self.drop_segment_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut rows = self.rows.write();
        for section in sections {
            rows.entry(section.document_id)
                .or_default()
                .sections
                .insert(section.id, section.clone());
        }
        Ok(())
    }

    async fn upsert_sentences(&self, sentences: &[Sentence]) -> Result<()> {
        if self.drop_segment_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut rows = self.rows.write();
        for sentence in sentences {
            rows.entry(sentence.document_id)
                .or_default()
                .sentences
                .insert(sentence.id, sentence.clone());
        }
        Ok(())
    }

    async fn list_sentences(&self, document_id: Uuid) -> Result<Vec<Sentence>> {
        let rows = self.rows.read();
        let Some(rows) = rows.get(&document_id) else {
            return Ok(Vec::new());
        };
        let mut sentences: Vec<Sentence> = rows.sentences.values().cloned().collect();
        sentences.sort_by_key(|s| {
            let section_ordinal = rows
                .sections
                .get(&s.section_id)
                .map(|section| section.ordinal)
                .unwrap_or(u32::MAX);
            (section_ordinal, s.ordinal)
        });
        Ok(sentences)
    }

    async fn save_classifications(&self, results: &[SentenceClassification]) -> Result<()> {
        let mut rows = self.rows.write();
        for result in results {
            let sentence = rows
                .values_mut()
                .find_map(|doc| doc.sentences.get_mut(&result.sentence_id));
            let Some(sentence) = sentence else {
                return Err(Error::storage(format!(
                    "Sentence {} does not exist",
                    result.sentence_id
                )));
            };
            match &result.outcome {
                ClassificationOutcome::Labeled(classification) => {
                    sentence.label = Some(classification.label.clone());
                    sentence.rationale = classification.rationale.clone();
                    sentence.classification_error = None;
                }
                ClassificationOutcome::Failed(message) => {
                    sentence.classification_error = Some(message.clone());
                }
            }
        }
        Ok(())
    }

    async fn count(&self, document_id: Uuid, query: CountQuery) -> Result<usize> {
        let rows = self.rows.read();
        let Some(rows) = rows.get(&document_id) else {
            return Ok(0);
        };
        let count = match query {
            CountQuery::Sections => rows.sections.len(),
            CountQuery::Sentences => rows.sentences.len(),
            CountQuery::OrphanSentences => rows
                .sentences
                .values()
                .filter(|s| !rows.sections.contains_key(&s.section_id))
                .count(),
            CountQuery::EmptySections => rows
                .sections
                .values()
                .filter(|s| s.content.trim().is_empty())
                .count(),
            CountQuery::EmptySentences => rows
                .sentences
                .values()
                .filter(|s| s.content.trim().is_empty())
                .count(),
            CountQuery::ClassifiedSentences => {
                rows.sentences.values().filter(|s| s.is_classified()).count()
            }
        };
        Ok(count)
    }
}

impl TaskJournal for MemoryStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        self.tasks.insert(record.id, record.clone());
        Ok(())
    }

    fn remove_task(&self, task_id: &TaskId) -> Result<()> {
        self.tasks.remove(task_id);
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}
