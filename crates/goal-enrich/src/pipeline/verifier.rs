//! Consistency checks on persisted pipeline output
//!
//! Everything is re-read from storage. A failing read is retried a few times
//! with a short sleep before the document is declared inconsistent.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::VerifierConfig;
use crate::error::{Error, Result};
use crate::storage::{CountQuery, DocumentStore};
use crate::types::ParsedStructure;

/// Figures observed by a passing verification
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct VerificationReport {
    pub metadata_bytes: usize,
    pub sections: usize,
    pub sentences: usize,
    pub orphan_sentences: usize,
    pub empty_items: usize,
    pub classified_sentences: usize,
    /// Reads needed before the checks passed
    pub attempts: u32,
}

/// Verifies a document before it is marked complete
pub struct ConsistencyVerifier {
    store: Arc<dyn DocumentStore>,
    config: VerifierConfig,
}

impl ConsistencyVerifier {
    pub fn new(store: Arc<dyn DocumentStore>, config: VerifierConfig) -> Self {
        Self { store, config }
    }

    /// Run every check; the error names the first check that failed
    pub async fn verify(&self, document_id: Uuid) -> Result<VerificationReport> {
        let attempts = self.config.read_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.check(document_id).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    return Ok(report);
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        "[{}] Verification read {}/{} failed: {}",
                        document_id,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.read_backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::verification(document_id, "no verification read")))
    }

    /// Persisted (section, sentence) counts, re-read until both are non-zero
    /// or the read budget runs out
    pub async fn reread_counts(&self, document_id: Uuid) -> Result<(usize, usize)> {
        let attempts = self.config.read_attempts.max(1);
        let mut counts = (0, 0);

        for attempt in 1..=attempts {
            counts = (
                self.store.count(document_id, CountQuery::Sections).await?,
                self.store.count(document_id, CountQuery::Sentences).await?,
            );
            if counts.0 > 0 && counts.1 > 0 {
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.config.read_backoff_ms)).await;
            }
        }
        Ok(counts)
    }

    async fn check(&self, document_id: Uuid) -> Result<VerificationReport> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))?;

        let metadata_bytes = match self.store.load_structure(document_id).await? {
            Some(payload) => metadata_size(document_id, &payload)?,
            None => 0,
        };
        if metadata_bytes == 0 {
            return Err(Error::verification(document_id, "structured metadata is missing"));
        }
        if metadata_bytes < self.config.min_metadata_bytes {
            return Err(Error::verification(
                document_id,
                format!(
                    "structured metadata is {} bytes, below the {} byte minimum",
                    metadata_bytes, self.config.min_metadata_bytes
                ),
            ));
        }

        let sections = self.store.count(document_id, CountQuery::Sections).await?;
        let sentences = self.store.count(document_id, CountQuery::Sentences).await?;
        if sections == 0 || sentences == 0 {
            return Err(Error::verification(
                document_id,
                format!("{} sections and {} sentences persisted", sections, sentences),
            ));
        }

        let orphan_sentences = self
            .store
            .count(document_id, CountQuery::OrphanSentences)
            .await?;
        let orphan_ratio = orphan_sentences as f64 / sentences as f64;
        if orphan_ratio >= self.config.max_orphan_ratio {
            return Err(Error::verification(
                document_id,
                format!(
                    "{} of {} sentences reference a missing section ({:.1}%)",
                    orphan_sentences,
                    sentences,
                    orphan_ratio * 100.0
                ),
            ));
        }

        let empty_items = self.store.count(document_id, CountQuery::EmptySections).await?
            + self.store.count(document_id, CountQuery::EmptySentences).await?;
        let empty_ratio = empty_items as f64 / (sections + sentences) as f64;
        if empty_ratio >= self.config.max_empty_ratio {
            return Err(Error::verification(
                document_id,
                format!(
                    "{} of {} sections and sentences are empty ({:.1}%)",
                    empty_items,
                    sections + sentences,
                    empty_ratio * 100.0
                ),
            ));
        }

        if !document.stage.classified() {
            return Err(Error::verification(
                document_id,
                format!("pipeline stopped at '{}'", document.stage.as_str()),
            ));
        }

        let classified_sentences = self
            .store
            .count(document_id, CountQuery::ClassifiedSentences)
            .await?;

        Ok(VerificationReport {
            metadata_bytes,
            sections,
            sentences,
            orphan_sentences,
            empty_items,
            classified_sentences,
            attempts: 0,
        })
    }
}

/// Serialized size of the parser's metadata object; null counts as absent
fn metadata_size(document_id: Uuid, payload: &str) -> Result<usize> {
    let structure: ParsedStructure = serde_json::from_str(payload).map_err(|e| {
        Error::verification(document_id, format!("stored structure is unreadable: {}", e))
    })?;
    if structure.metadata.is_null() {
        return Ok(0);
    }
    Ok(serde_json::to_string(&structure.metadata)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{Document, PipelineStage, RawSection, Section, Sentence};

    fn fast_config() -> VerifierConfig {
        VerifierConfig {
            read_attempts: 2,
            read_backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn complete_document(store: &MemoryStore) -> Uuid {
        let document = Document::new("paper.pdf");
        let id = document.id;
        store.put_document(&document).await.unwrap();
        store
            .save_structure(
                id,
                &ParsedStructure {
                    metadata: serde_json::json!({ "title": "A paper about things", "pages": 12 }),
                    sections: vec![RawSection {
                        title: None,
                        text: "Body.".to_string(),
                        page: Some(1),
                    }],
                    language: None,
                },
            )
            .await
            .unwrap();

        let section = Section {
            id: Section::derive_id(id, 0),
            document_id: id,
            ordinal: 0,
            title: None,
            content: "Body.".to_string(),
            page: Some(1),
        };
        store.upsert_sections(&[section.clone()]).await.unwrap();
        store
            .upsert_sentences(&[Sentence::new(id, section.id, 0, "Body.")])
            .await
            .unwrap();
        for stage in [
            PipelineStage::StructureParsed,
            PipelineStage::Segmented,
            PipelineStage::Classified,
        ] {
            store.set_stage(id, stage).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_consistent_document_passes() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;

        let report = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap();
        assert_eq!(report.sections, 1);
        assert_eq!(report.sentences, 1);
        assert_eq!(report.attempts, 1);
    }

    async fn with_metadata(store: &MemoryStore, id: Uuid, metadata: serde_json::Value) {
        let structure = ParsedStructure {
            metadata,
            ..Default::default()
        };
        store.save_structure(id, &structure).await.unwrap();
    }

    #[tokio::test]
    async fn test_tiny_metadata_fails() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;
        with_metadata(&store, id, serde_json::json!({})).await;

        let err = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "verification_failed");
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("2 bytes, below the 32 byte minimum"));
    }

    #[tokio::test]
    async fn test_empty_parser_result_fails() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;
        store
            .save_structure(id, &ParsedStructure::default())
            .await
            .unwrap();

        let err = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("metadata is missing"));
    }

    #[tokio::test]
    async fn test_metadata_size_ignores_sections() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;
        let metadata = serde_json::json!({ "title": "A paper about things", "pages": 12 });
        let expected = serde_json::to_string(&metadata).unwrap().len();

        let report = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap();
        assert_eq!(report.metadata_bytes, expected);
    }

    #[tokio::test]
    async fn test_orphans_fail() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;
        store
            .upsert_sentences(&[Sentence::new(id, Uuid::new_v4(), 0, "Dangling.")])
            .await
            .unwrap();

        let err = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing section"));
    }

    #[tokio::test]
    async fn test_empty_content_fails() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;
        let section_id = Section::derive_id(id, 0);
        store
            .upsert_sentences(&[Sentence::new(id, section_id, 1, "   ")])
            .await
            .unwrap();

        let err = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_unclassified_stage_fails() {
        let store = Arc::new(MemoryStore::new());
        let id = complete_document(&store).await;
        store.rewind_stage(id, PipelineStage::Segmented).await.unwrap();

        let err = ConsistencyVerifier::new(store, fast_config())
            .verify(id)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("segmented"));
    }

    #[tokio::test]
    async fn test_missing_document_is_permanent() {
        let store = Arc::new(MemoryStore::new());
        let err = ConsistencyVerifier::new(store, fast_config())
            .verify(Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "document_not_found");
    }
}
