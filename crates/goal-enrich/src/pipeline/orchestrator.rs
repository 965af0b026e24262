//! Resumable document pipeline: resolve, parse, segment, classify, verify
//!
//! Every stage checks the document's checkpoint first, so running the
//! handler again after a failure only redoes unfinished work.

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::{PipelineConfig, VerifierConfig};
use crate::error::{Error, Result};
use crate::processing::{TaskContext, TaskHandler};
use crate::providers::Collaborators;
use crate::storage::DocumentStore;
use crate::types::{
    ClassificationOutcome, Document, DocumentJob, DocumentStatus, ParsedStructure, PipelineStage,
    ProgressTracker, Section, Sentence, SentenceClassification, TaskType,
};

use super::resolver::{ResolvedSource, SourceResolver};
use super::verifier::{ConsistencyVerifier, VerificationReport};

/// Resolve, parse, segment, classify, verify
const TOTAL_STEPS: u32 = 5;

/// Result stored on a completed task
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub document_id: Uuid,
    /// Stages that did work in this run
    pub stages_run: Vec<&'static str>,
    pub classification_failures: usize,
    pub source_deleted: bool,
    pub verification: VerificationReport,
}

/// Task handler for `process_document` and `reclassify`
pub struct PipelineOrchestrator {
    store: Arc<dyn DocumentStore>,
    collaborators: Collaborators,
    resolver: SourceResolver,
    verifier: ConsistencyVerifier,
    config: PipelineConfig,
}

/// Per-run state threaded through the stages
struct Run<'a> {
    ctx: &'a TaskContext,
    job: DocumentJob,
    document: Document,
    progress: ProgressTracker,
    source: Option<ResolvedSource>,
    stages_run: Vec<&'static str>,
    classification_failures: usize,
}

impl Run<'_> {
    fn step(&mut self, step: u32, name: &str) -> Result<()> {
        if self.ctx.is_cancelled() {
            tracing::info!("[{}] Cancellation observed before {}", self.document.id, name);
            return Err(Error::Cancelled);
        }
        self.progress.advance(step, name);
        self.ctx.report_progress(self.progress.clone());
        Ok(())
    }

    fn detail(&mut self, key: &str, value: serde_json::Value) {
        self.progress.set_detail(key, value);
        self.ctx.report_progress(self.progress.clone());
    }
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collaborators: Collaborators,
        config: PipelineConfig,
        verifier_config: VerifierConfig,
    ) -> Self {
        Self {
            resolver: SourceResolver::new(&config),
            verifier: ConsistencyVerifier::new(store.clone(), verifier_config),
            store,
            collaborators,
            config,
        }
    }

    /// Task types this handler serves
    pub fn task_types() -> [TaskType; 2] {
        [TaskType::ProcessDocument, TaskType::Reclassify]
    }

    async fn run(&self, ctx: &TaskContext) -> Result<PipelineOutcome> {
        let job = ctx.payload().document_job().clone();
        let document_id = job.document_id;

        let mut document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(Error::DocumentNotFound(document_id))?;

        if ctx.task().task_type == TaskType::Reclassify && ctx.retry_count() == 0 {
            if document.stage > PipelineStage::Segmented {
                tracing::info!("[{}] Rewinding to segmented for reclassification", document_id);
            }
            self.store
                .rewind_stage(document_id, PipelineStage::Segmented)
                .await?;
            document.stage = document.stage.min(PipelineStage::Segmented);
        }

        self.store
            .set_status(document_id, DocumentStatus::Processing, None)
            .await?;

        let mut run = Run {
            ctx,
            job,
            document,
            progress: ProgressTracker::new(TOTAL_STEPS),
            source: None,
            stages_run: Vec::new(),
            classification_failures: 0,
        };

        self.parse_stage(&mut run).await?;
        self.segment_stage(&mut run).await?;
        self.classify_stage(&mut run).await?;

        run.step(5, "verify")?;
        let verification = self.verifier.verify(document_id).await?;
        run.step(5, "finalize")?;
        self.store
            .set_status(document_id, DocumentStatus::Completed, None)
            .await?;

        let source_deleted = self.cleanup_source(&mut run).await;

        tracing::info!(
            "[{}] COMPLETE: {} sections, {} sentences, {} classified",
            document_id,
            verification.sections,
            verification.sentences,
            verification.classified_sentences
        );

        Ok(PipelineOutcome {
            document_id,
            stages_run: run.stages_run,
            classification_failures: run.classification_failures,
            source_deleted,
            verification,
        })
    }

    /// Stages 1 and 2: locate the source and parse it
    async fn parse_stage(&self, run: &mut Run<'_>) -> Result<()> {
        let document_id = run.document.id;
        run.step(1, "resolve")?;
        if run.document.stage.structure_parsed() {
            tracing::debug!("[{}] Structure already parsed, skipping", document_id);
            return Ok(());
        }

        let source = self.resolver.resolve(&run.document).await?;
        run.detail("source", serde_json::json!(source.location.to_string()));

        run.step(2, "parse")?;
        tracing::info!("[{}] Parsing {}", document_id, source.path.display());
        let structure = self
            .collaborators
            .parser
            .parse(&run.document, &source.path)
            .await?;

        self.store.save_structure(document_id, &structure).await?;
        self.store
            .set_stage(document_id, PipelineStage::StructureParsed)
            .await?;
        run.document.stage = PipelineStage::StructureParsed;
        run.source = Some(source);
        run.stages_run.push("parse");
        run.detail("raw_sections", serde_json::json!(structure.sections.len()));
        Ok(())
    }

    /// Stage 3: sections from the stored structure, sentences from the segmenter
    async fn segment_stage(&self, run: &mut Run<'_>) -> Result<()> {
        let document_id = run.document.id;
        run.step(3, "segment")?;
        if run.document.stage.segmented() {
            tracing::debug!("[{}] Already segmented, skipping", document_id);
            return Ok(());
        }

        let payload = self
            .store
            .load_structure(document_id)
            .await?
            .ok_or_else(|| {
                Error::storage(format!("Structure for {} is marked parsed but missing", document_id))
            })?;
        let structure: ParsedStructure = serde_json::from_str(&payload)?;

        let language = run
            .job
            .options
            .language
            .clone()
            .or_else(|| run.document.language.clone())
            .or_else(|| structure.language.clone())
            .unwrap_or_else(|| self.config.default_language.clone());

        let sections: Vec<Section> = structure
            .sections
            .iter()
            .filter(|raw| !raw.text.trim().is_empty())
            .enumerate()
            .map(|(ordinal, raw)| Section {
                id: Section::derive_id(document_id, ordinal as u32),
                document_id,
                ordinal: ordinal as u32,
                title: raw.title.clone(),
                content: raw.text.clone(),
                page: raw.page,
            })
            .collect();

        if sections.is_empty() {
            return Err(Error::EmptySegmentation {
                document_id,
                sections: 0,
                sentences: 0,
            });
        }

        let contents: Vec<String> = sections.iter().map(|s| s.content.clone()).collect();
        let segmented: Vec<Result<Vec<String>>> = stream::iter(contents)
            .map(|content| {
                let segmenter = self.collaborators.segmenter.clone();
                let language = language.clone();
                async move { segmenter.segment(&content, &language).await }
            })
            .buffered(self.config.segment_concurrency.max(1))
            .collect()
            .await;

        let mut sentences = Vec::new();
        for (section, result) in sections.iter().zip(segmented) {
            let texts = result?;
            sentences.extend(
                texts
                    .iter()
                    .map(|text| text.trim())
                    .filter(|text| !text.is_empty())
                    .enumerate()
                    .map(|(ordinal, text)| {
                        Sentence::new(document_id, section.id, ordinal as u32, text)
                    }),
            );
        }

        if sentences.is_empty() {
            return Err(Error::EmptySegmentation {
                document_id,
                sections: sections.len(),
                sentences: 0,
            });
        }

        self.store.upsert_sections(&sections).await?;
        self.store.upsert_sentences(&sentences).await?;

        let (persisted_sections, persisted_sentences) =
            self.verifier.reread_counts(document_id).await?;
        if persisted_sections == 0 || persisted_sentences == 0 {
            tracing::warn!(
                "[{}] Wrote {} sections and {} sentences but read back {} and {}",
                document_id,
                sections.len(),
                sentences.len(),
                persisted_sections,
                persisted_sentences
            );
            return Err(Error::EmptySegmentation {
                document_id,
                sections: persisted_sections,
                sentences: persisted_sentences,
            });
        }

        self.store
            .set_stage(document_id, PipelineStage::Segmented)
            .await?;
        run.document.stage = PipelineStage::Segmented;
        run.stages_run.push("segment");
        run.detail("sections", serde_json::json!(persisted_sections));
        run.detail("sentences", serde_json::json!(persisted_sentences));

        tracing::info!(
            "[{}] Segmented into {} sections, {} sentences",
            document_id,
            persisted_sections,
            persisted_sentences
        );
        Ok(())
    }

    /// Stage 4: classify every unlabeled sentence under a bounded fan-out
    async fn classify_stage(&self, run: &mut Run<'_>) -> Result<()> {
        let document_id = run.document.id;
        run.step(4, "classify")?;
        if run.document.stage.classified() {
            tracing::debug!("[{}] Already classified, skipping", document_id);
            return Ok(());
        }

        let pending: Vec<Sentence> = self
            .store
            .list_sentences(document_id)
            .await?
            .into_iter()
            .filter(|s| !s.is_classified())
            .collect();
        let total = pending.len();

        let limit = run
            .job
            .options
            .classify_concurrency
            .unwrap_or(self.config.classify_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        tracing::info!(
            "[{}] Classifying {} sentences ({} concurrent)",
            document_id,
            total,
            limit
        );

        let futures = pending.iter().map(|sentence| {
            let sem = semaphore.clone();
            let classifier = self.collaborators.classifier.clone();
            async move {
                let outcome = match sem.acquire().await {
                    Ok(_permit) => classifier.classify(&sentence.content).await,
                    Err(e) => Err(Error::internal(format!("Classifier limiter closed: {}", e))),
                };
                (sentence.id, outcome)
            }
        });
        let results = join_all(futures).await;

        let mut failed = 0;
        let mut unavailable = 0;
        let classifications: Vec<SentenceClassification> = results
            .into_iter()
            .map(|(sentence_id, outcome)| {
                let outcome = match outcome {
                    Ok(classification) => ClassificationOutcome::Labeled(classification),
                    Err(e) => {
                        failed += 1;
                        if !matches!(e, Error::ClassificationRejected(_)) {
                            unavailable += 1;
                        }
                        tracing::warn!(
                            "[{}] Classification failed for sentence {}: {}",
                            document_id,
                            sentence_id,
                            e
                        );
                        ClassificationOutcome::Failed(e.to_string())
                    }
                };
                SentenceClassification {
                    sentence_id,
                    outcome,
                }
            })
            .collect();

        self.store.save_classifications(&classifications).await?;
        run.classification_failures = failed;
        run.detail("classification_failures", serde_json::json!(failed));

        if self.is_outage(unavailable, total) {
            tracing::error!(
                "[{}] Classifier outage: {}/{} sentences failed ({} unavailable)",
                document_id,
                failed,
                total,
                unavailable
            );
            return Err(Error::ClassifierUnavailable { failed, total });
        }

        self.store
            .set_stage(document_id, PipelineStage::Classified)
            .await?;
        run.document.stage = PipelineStage::Classified;
        run.stages_run.push("classify");
        Ok(())
    }

    /// Whether availability failures in one pass amount to a collaborator
    /// outage. Rejected sentences never count.
    fn is_outage(&self, unavailable: usize, total: usize) -> bool {
        if unavailable == 0 || total == 0 {
            return false;
        }
        if unavailable < total && unavailable < self.config.classifier_outage_min_failures {
            return false;
        }
        unavailable as f64 / total as f64 >= self.config.classifier_outage_ratio
    }

    /// Delete the source after a verified run. Failures only warn.
    async fn cleanup_source(&self, run: &mut Run<'_>) -> bool {
        if !self.config.delete_source_on_success || run.job.options.keep_source {
            return false;
        }

        let source = match run.source.take() {
            Some(source) => source,
            None => match self.resolver.resolve(&run.document).await {
                Ok(source) => source,
                Err(_) => return false,
            },
        };

        match self.resolver.delete(&source).await {
            Ok(()) => {
                tracing::info!("[{}] Deleted source {}", run.document.id, source.path.display());
                true
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] Failed to delete source {}: {}",
                    run.document.id,
                    source.path.display(),
                    e
                );
                false
            }
        }
    }

    /// Reflect a failed run on the document row
    async fn record_failure(&self, ctx: &TaskContext, document_id: Uuid, err: &Error) {
        let (status, message) = match err {
            Error::DocumentNotFound(_) => return,
            Error::Cancelled => (DocumentStatus::Pending, "cancelled".to_string()),
            e if e.is_permanent() || ctx.is_final_attempt() => {
                (DocumentStatus::Failed, e.to_string())
            }
            // Will retry; keep the last error visible
            e => (DocumentStatus::Processing, e.to_string()),
        };

        if let Err(e) = self
            .store
            .set_status(document_id, status, Some(message))
            .await
        {
            tracing::warn!("[{}] Failed to record document failure: {}", document_id, e);
        }
    }
}

#[async_trait]
impl TaskHandler for PipelineOrchestrator {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        let document_id = ctx.payload().document_job().document_id;

        match self.run(ctx).await {
            Ok(outcome) => Ok(serde_json::to_value(outcome)?),
            Err(e) => {
                self.record_failure(ctx, document_id, &e).await;
                Err(e)
            }
        }
    }

    async fn on_timeout(&self, ctx: &TaskContext, error: &Error) {
        let document_id = ctx.payload().document_job().document_id;
        self.record_failure(ctx, document_id, error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::processing::{HandlerRegistry, Worker};
    use crate::providers::{MockClassifier, MockSegmenter, MockStructuralParser, StructuralParser};
    use crate::scheduler::{RetryPolicy, Scheduler};
    use crate::storage::{CountQuery, MemoryStore};
    use crate::types::{
        Classification, JobOptions, RawSection, SubmitRequest, TaskPayload, TaskStatus,
    };
    use std::path::Path;
    use std::time::Duration;

    fn structure(sections: &[&str]) -> ParsedStructure {
        ParsedStructure {
            metadata: serde_json::json!({ "title": "Quarterly report", "pages": 3 }),
            sections: sections
                .iter()
                .map(|text| RawSection {
                    title: None,
                    text: text.to_string(),
                    page: Some(1),
                })
                .collect(),
            language: Some("en".to_string()),
        }
    }

    fn split_segmenter() -> MockSegmenter {
        let mut segmenter = MockSegmenter::new();
        segmenter.expect_segment().returning(|text, _| {
            Ok(text
                .split_inclusive('.')
                .map(|s| s.trim().to_string())
                .collect())
        });
        segmenter
    }

    fn labeling_classifier() -> MockClassifier {
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(|_| {
            Ok(Classification {
                label: "statement".to_string(),
                rationale: None,
            })
        });
        classifier
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        parser: MockStructuralParser,
        segmenter: MockSegmenter,
        classifier: MockClassifier,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            store,
            Collaborators {
                parser: Arc::new(parser),
                segmenter: Arc::new(segmenter),
                classifier: Arc::new(classifier),
            },
            PipelineConfig::default(),
            VerifierConfig {
                read_attempts: 2,
                read_backoff_ms: 1,
                ..Default::default()
            },
        )
    }

    fn context(payload: TaskPayload, max_retries: u32) -> TaskContext {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        scheduler.submit(SubmitRequest::new(payload).with_max_retries(max_retries));
        let task = scheduler.next().unwrap();
        TaskContext::new(task, scheduler)
    }

    fn process(document_id: Uuid) -> TaskContext {
        context(TaskPayload::ProcessDocument(DocumentJob::new(document_id)), 3)
    }

    /// Document with a source file on disk
    async fn uploaded(store: &MemoryStore, dir: &Path) -> Document {
        let path = dir.join("report.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        let document = Document::new("report.pdf").with_storage_path(&path);
        store.put_document(&document).await.unwrap();
        document
    }

    #[tokio::test]
    async fn test_full_run_completes_and_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let document = uploaded(&store, dir.path()).await;

        let mut parser = MockStructuralParser::new();
        parser
            .expect_parse()
            .times(1)
            .returning(|_, _| Ok(structure(&["Revenue grew. Costs fell.", "Outlook is stable."])));

        let handler = orchestrator(store.clone(), parser, split_segmenter(), labeling_classifier());
        let result = handler.handle(&process(document.id)).await.unwrap();

        assert_eq!(result["source_deleted"], true);
        assert_eq!(result["verification"]["sentences"], 3);
        assert!(!document.storage_path.unwrap().exists());

        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, PipelineStage::Classified);
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert_eq!(store.count(document.id, CountQuery::ClassifiedSentences).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_resume_after_parse_skips_parser() {
        let store = Arc::new(MemoryStore::new());
        let document = Document::new("already-parsed.pdf");
        store.put_document(&document).await.unwrap();
        store
            .save_structure(document.id, &structure(&["One. Two."]))
            .await
            .unwrap();
        store
            .set_stage(document.id, PipelineStage::StructureParsed)
            .await
            .unwrap();

        let mut parser = MockStructuralParser::new();
        parser.expect_parse().times(0);
        let mut segmenter = MockSegmenter::new();
        segmenter
            .expect_segment()
            .times(1..)
            .returning(|_, _| Ok(vec!["One.".to_string(), "Two.".to_string()]));

        let handler = orchestrator(store.clone(), parser, segmenter, labeling_classifier());
        let result = handler.handle(&process(document.id)).await.unwrap();

        assert_eq!(result["stages_run"], serde_json::json!(["segment", "classify"]));
        // No source known and none on disk: nothing to delete, still complete
        assert_eq!(result["source_deleted"], false);
    }

    #[tokio::test]
    async fn test_zero_sections_do_not_advance() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let document = uploaded(&store, dir.path()).await;

        let mut parser = MockStructuralParser::new();
        parser
            .expect_parse()
            .returning(|_, _| Ok(structure(&["   "])));
        let mut segmenter = MockSegmenter::new();
        segmenter.expect_segment().times(0);

        let handler = orchestrator(store.clone(), parser, segmenter, labeling_classifier());
        let err = handler.handle(&process(document.id)).await.unwrap_err();

        assert_eq!(err.code(), "empty_segmentation");
        assert!(!err.is_permanent());
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, PipelineStage::StructureParsed);
        assert_eq!(stored.status, DocumentStatus::Processing);
        assert!(stored.error.is_some());
    }

    #[tokio::test]
    async fn test_lost_segment_writes_raise() {
        let store = Arc::new(MemoryStore::new());
        let document = Document::new("lagging.pdf");
        store.put_document(&document).await.unwrap();
        store
            .save_structure(document.id, &structure(&["A. B."]))
            .await
            .unwrap();
        store
            .set_stage(document.id, PipelineStage::StructureParsed)
            .await
            .unwrap();
        store.drop_segment_writes(true);

        let handler = orchestrator(
            store.clone(),
            MockStructuralParser::new(),
            split_segmenter(),
            labeling_classifier(),
        );
        let err = handler.handle(&process(document.id)).await.unwrap_err();

        assert!(matches!(
            err,
            Error::EmptySegmentation {
                sections: 0,
                sentences: 0,
                ..
            }
        ));
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert!(!stored.stage.segmented());
    }

    #[tokio::test]
    async fn test_classifier_outage_keeps_partial_labels() {
        let store = Arc::new(MemoryStore::new());
        let document = Document::new("outage.pdf");
        store.put_document(&document).await.unwrap();
        store
            .save_structure(document.id, &structure(&["Alpha. Beta. Gamma. Delta."]))
            .await
            .unwrap();
        store
            .set_stage(document.id, PipelineStage::StructureParsed)
            .await
            .unwrap();

        // Only "Alpha." gets through the first time
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(|sentence| {
            if sentence == "Alpha." {
                Ok(Classification {
                    label: "lead".to_string(),
                    rationale: None,
                })
            } else {
                Err(Error::collaborator("classifier", "503 Service Unavailable"))
            }
        });

        let handler = orchestrator(
            store.clone(),
            MockStructuralParser::new(),
            split_segmenter(),
            classifier,
        );
        let err = handler.handle(&process(document.id)).await.unwrap_err();
        assert!(matches!(err, Error::ClassifierUnavailable { failed: 3, total: 4 }));
        assert_eq!(
            store
                .count(document.id, CountQuery::ClassifiedSentences)
                .await
                .unwrap(),
            1
        );

        // The retry only sends the three unlabeled sentences
        let mut classifier = MockClassifier::new();
        classifier
            .expect_classify()
            .times(3)
            .returning(|_| {
                Ok(Classification {
                    label: "body".to_string(),
                    rationale: Some("retried".to_string()),
                })
            });
        let mut segmenter = MockSegmenter::new();
        segmenter.expect_segment().times(0);
        let handler = orchestrator(store.clone(), MockStructuralParser::new(), segmenter, classifier);
        handler.handle(&process(document.id)).await.unwrap();

        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_sentence_failure_is_partial() {
        let store = Arc::new(MemoryStore::new());
        let document = Document::new("partial.pdf");
        store.put_document(&document).await.unwrap();
        store
            .save_structure(document.id, &structure(&["A. B. C. D. E."]))
            .await
            .unwrap();
        store
            .set_stage(document.id, PipelineStage::StructureParsed)
            .await
            .unwrap();

        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(|sentence| {
            if sentence == "C." {
                Err(Error::ClassificationRejected("malformed output".to_string()))
            } else {
                Ok(Classification {
                    label: "x".to_string(),
                    rationale: None,
                })
            }
        });

        let handler = orchestrator(
            store.clone(),
            MockStructuralParser::new(),
            split_segmenter(),
            classifier,
        );
        let result = handler.handle(&process(document.id)).await.unwrap();
        assert_eq!(result["classification_failures"], 1);

        let sentences = store.list_sentences(document.id).await.unwrap();
        let failed: Vec<_> = sentences
            .iter()
            .filter(|s| s.classification_error.is_some())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].content, "C.");
    }

    /// Document already parsed into one section of the given text
    async fn parsed(store: &MemoryStore, text: &str) -> Document {
        let document = Document::new("short.pdf");
        store.put_document(&document).await.unwrap();
        store
            .save_structure(document.id, &structure(&[text]))
            .await
            .unwrap();
        store
            .set_stage(document.id, PipelineStage::StructureParsed)
            .await
            .unwrap();
        document
    }

    fn failing_on(bad: &'static str, err: fn() -> Error) -> MockClassifier {
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().returning(move |sentence| {
            if sentence == bad {
                Err(err())
            } else {
                Ok(Classification {
                    label: "ok".to_string(),
                    rationale: None,
                })
            }
        });
        classifier
    }

    #[tokio::test]
    async fn test_rejected_sentence_in_short_document_completes() {
        let store = Arc::new(MemoryStore::new());
        let document = parsed(&store, "Good one. Bad one.").await;

        let classifier = failing_on("Bad one.", || {
            Error::ClassificationRejected("422 Unprocessable Entity".to_string())
        });
        let handler = orchestrator(
            store.clone(),
            MockStructuralParser::new(),
            split_segmenter(),
            classifier,
        );
        let result = handler.handle(&process(document.id)).await.unwrap();

        assert_eq!(result["classification_failures"], 1);
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_one_unavailable_sentence_is_below_outage_sample() {
        let store = Arc::new(MemoryStore::new());
        let document = parsed(&store, "Good one. Bad one.").await;

        let classifier = failing_on("Bad one.", || {
            Error::collaborator("classifier", "request failed: connection reset")
        });
        let handler = orchestrator(
            store.clone(),
            MockStructuralParser::new(),
            split_segmenter(),
            classifier,
        );
        let result = handler.handle(&process(document.id)).await.unwrap();
        assert_eq!(result["classification_failures"], 1);
    }

    #[tokio::test]
    async fn test_every_sentence_unavailable_is_outage() {
        let store = Arc::new(MemoryStore::new());
        let document = parsed(&store, "Only one.").await;

        let classifier = failing_on("Only one.", || {
            Error::collaborator("classifier", "503 Service Unavailable")
        });
        let handler = orchestrator(
            store.clone(),
            MockStructuralParser::new(),
            split_segmenter(),
            classifier,
        );
        let err = handler.handle(&process(document.id)).await.unwrap_err();
        assert!(matches!(err, Error::ClassifierUnavailable { failed: 1, total: 1 }));

        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, PipelineStage::Segmented);
    }

    #[tokio::test]
    async fn test_missing_source_marks_document_failed() {
        let store = Arc::new(MemoryStore::new());
        let document = Document::new("vanished.pdf").with_storage_path("/nonexistent/vanished.pdf");
        store.put_document(&document).await.unwrap();

        let mut parser = MockStructuralParser::new();
        parser.expect_parse().times(0);
        let handler = orchestrator(store.clone(), parser, split_segmenter(), labeling_classifier());
        let err = handler.handle(&process(document.id)).await.unwrap_err();

        assert!(err.is_permanent());
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert!(stored.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_reclassify_relabels_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let document = uploaded(&store, dir.path()).await;

        let mut parser = MockStructuralParser::new();
        parser
            .expect_parse()
            .times(1)
            .returning(|_, _| Ok(structure(&["First. Second."])));
        let handler = orchestrator(store.clone(), parser, split_segmenter(), labeling_classifier());
        let job = DocumentJob {
            document_id: document.id,
            options: JobOptions {
                keep_source: true,
                ..Default::default()
            },
        };
        handler
            .handle(&context(TaskPayload::ProcessDocument(job.clone()), 3))
            .await
            .unwrap();
        assert!(document.storage_path.as_ref().unwrap().exists());

        let mut parser = MockStructuralParser::new();
        parser.expect_parse().times(0);
        let mut segmenter = MockSegmenter::new();
        segmenter.expect_segment().times(0);
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().times(2).returning(|_| {
            Ok(Classification {
                label: "revised".to_string(),
                rationale: None,
            })
        });
        let handler = orchestrator(store.clone(), parser, segmenter, classifier);
        let result = handler
            .handle(&context(TaskPayload::Reclassify(job), 3))
            .await
            .unwrap();

        assert_eq!(result["stages_run"], serde_json::json!(["classify"]));
        let sentences = store.list_sentences(document.id).await.unwrap();
        assert!(sentences
            .iter()
            .all(|s| s.label.as_deref() == Some("revised")));
    }

    #[tokio::test]
    async fn test_cancelled_task_stops_before_work() {
        let store = Arc::new(MemoryStore::new());
        let document = Document::new("cancel.pdf");
        store.put_document(&document).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        let id = scheduler.submit(SubmitRequest::new(TaskPayload::ProcessDocument(
            DocumentJob::new(document.id),
        )));
        let task = scheduler.next().unwrap();
        scheduler.cancel(&id);

        let mut parser = MockStructuralParser::new();
        parser.expect_parse().times(0);
        let handler = orchestrator(store.clone(), parser, split_segmenter(), labeling_classifier());
        let err = handler
            .handle(&TaskContext::new(task, scheduler))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Pending);
    }

    /// Parser that never answers within a short task timeout
    struct StalledParser;

    #[async_trait]
    impl StructuralParser for StalledParser {
        async fn parse(&self, _document: &Document, _path: &Path) -> Result<ParsedStructure> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(structure(&["Too late."]))
        }
    }

    #[tokio::test]
    async fn test_timeout_on_final_attempt_fails_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let document = uploaded(&store, dir.path()).await;

        let handler = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            Collaborators {
                parser: Arc::new(StalledParser),
                segmenter: Arc::new(split_segmenter()),
                classifier: Arc::new(labeling_classifier()),
            },
            PipelineConfig::default(),
            VerifierConfig::default(),
        ));
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::ProcessDocument, handler).unwrap();

        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        let id = scheduler.submit(
            SubmitRequest::new(TaskPayload::ProcessDocument(DocumentJob::new(document.id)))
                .with_max_retries(0)
                .with_timeout(Duration::from_millis(30)),
        );
        Worker::new(scheduler.clone(), Arc::new(registry), RetryPolicy::immediate())
            .drain()
            .await;

        assert_eq!(scheduler.get(&id).unwrap().status, TaskStatus::Failed);
        let stored = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert!(stored.error.unwrap().contains("timed out"));
        // parsing never finished, so the source stays for a manual retry
        assert!(document.storage_path.unwrap().exists());
    }
}
