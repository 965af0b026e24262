//! SQLite store for documents, derived rows and the task journal

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::scheduler::TaskJournal;
use crate::types::{
    ClassificationOutcome, Document, DocumentStatus, ParsedStructure, PipelineStage, Section,
    Sentence, SentenceClassification, TaskId, TaskRecord,
};

use super::{check_advance, CountQuery, DocumentStore};

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=OFF;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::storage(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                owner TEXT,
                filename TEXT NOT NULL,
                content_hash TEXT,
                storage_path TEXT,
                language TEXT,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS structures (
                document_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sections (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                title TEXT,
                content TEXT NOT NULL,
                page INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_sections_document ON sections(document_id);

            CREATE TABLE IF NOT EXISTS sentences (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                section_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                label TEXT,
                rationale TEXT,
                classification_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sentences_document ON sentences(document_id);
            CREATE INDEX IF NOT EXISTS idx_sentences_section ON sentences(section_id);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
        )
        .map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

        tracing::info!("Database migrations complete");
        Ok(())
    }

    /// Run a synchronous operation on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    // ==================== Documents ====================

    pub fn fetch_document(&self, document_id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, owner, filename, content_hash, storage_path, language, stage, status,
                    error, created_at, updated_at
             FROM documents WHERE id = ?1",
            params![document_id.to_string()],
            row_to_document,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to get document: {}", e)))
    }

    pub fn write_document(&self, document: &Document) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO documents (
                id, owner, filename, content_hash, storage_path, language, stage, status,
                error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                filename = excluded.filename,
                content_hash = excluded.content_hash,
                storage_path = excluded.storage_path,
                language = excluded.language,
                stage = excluded.stage,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
            params![
                document.id.to_string(),
                document.owner,
                document.filename,
                document.content_hash,
                document
                    .storage_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                document.language,
                document.stage.as_str(),
                document.status.as_str(),
                document.error,
                document.created_at.to_rfc3339(),
                document.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::storage(format!("Failed to upsert document: {}", e)))?;
        Ok(())
    }

    fn current_stage(conn: &Connection, document_id: Uuid) -> Result<PipelineStage> {
        let stage: Option<String> = conn
            .query_row(
                "SELECT stage FROM documents WHERE id = ?1",
                params![document_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::storage(format!("Failed to read stage: {}", e)))?;
        let stage = stage.ok_or(Error::DocumentNotFound(document_id))?;
        PipelineStage::parse(&stage)
            .ok_or_else(|| Error::storage(format!("Unknown stage '{}' for {}", stage, document_id)))
    }

    pub fn advance_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

        let current = Self::current_stage(&tx, document_id)?;
        if check_advance(document_id, current, stage)? {
            tx.execute(
                "UPDATE documents SET stage = ?2, updated_at = ?3 WHERE id = ?1",
                params![document_id.to_string(), stage.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::storage(format!("Failed to set stage: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit stage: {}", e)))
    }

    pub fn rewind(&self, document_id: Uuid, stage: PipelineStage) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;
        let id = document_id.to_string();

        let current = Self::current_stage(&tx, document_id)?;
        if current > stage {
            tx.execute(
                "UPDATE documents SET stage = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, stage.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::storage(format!("Failed to rewind stage: {}", e)))?;
        }

        let cleanup = if stage < PipelineStage::StructureParsed {
            vec![
                "DELETE FROM structures WHERE document_id = ?1",
                "DELETE FROM sentences WHERE document_id = ?1",
                "DELETE FROM sections WHERE document_id = ?1",
            ]
        } else if stage < PipelineStage::Segmented {
            vec![
                "DELETE FROM sentences WHERE document_id = ?1",
                "DELETE FROM sections WHERE document_id = ?1",
            ]
        } else if stage < PipelineStage::Classified {
            vec![
                "UPDATE sentences SET label = NULL, rationale = NULL, classification_error = NULL
                 WHERE document_id = ?1",
            ]
        } else {
            Vec::new()
        };
        for sql in cleanup {
            tx.execute(sql, params![id])
                .map_err(|e| Error::storage(format!("Failed to drop stage output: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit rewind: {}", e)))
    }

    pub fn write_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE documents SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    document_id.to_string(),
                    status.as_str(),
                    error,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| Error::storage(format!("Failed to set status: {}", e)))?;
        if updated == 0 {
            return Err(Error::DocumentNotFound(document_id));
        }
        Ok(())
    }

    // ==================== Structure ====================

    pub fn write_structure(&self, document_id: Uuid, payload: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO structures (document_id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(document_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![document_id.to_string(), payload, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::storage(format!("Failed to save structure: {}", e)))?;
        Ok(())
    }

    pub fn fetch_structure(&self, document_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT payload FROM structures WHERE document_id = ?1",
            params![document_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to load structure: {}", e)))
    }

    // ==================== Sections & sentences ====================

    pub fn write_sections(&self, sections: &[Section]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO sections (id, document_id, ordinal, title, content, page)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        ordinal = excluded.ordinal,
                        title = excluded.title,
                        content = excluded.content,
                        page = excluded.page",
                )
                .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

            for section in sections {
                stmt.execute(params![
                    section.id.to_string(),
                    section.document_id.to_string(),
                    section.ordinal,
                    section.title,
                    section.content,
                    section.page,
                ])
                .map_err(|e| Error::storage(format!("Failed to upsert section: {}", e)))?;
            }
        }

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit sections: {}", e)))
    }

    pub fn write_sentences(&self, sentences: &[Sentence]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO sentences (
                        id, document_id, section_id, ordinal, content,
                        label, rationale, classification_error
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        section_id = excluded.section_id,
                        ordinal = excluded.ordinal,
                        content = excluded.content",
                )
                .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

            for sentence in sentences {
                stmt.execute(params![
                    sentence.id.to_string(),
                    sentence.document_id.to_string(),
                    sentence.section_id.to_string(),
                    sentence.ordinal,
                    sentence.content,
                    sentence.label,
                    sentence.rationale,
                    sentence.classification_error,
                ])
                .map_err(|e| Error::storage(format!("Failed to upsert sentence: {}", e)))?;
            }
        }

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit sentences: {}", e)))
    }

    pub fn fetch_sentences(&self, document_id: Uuid) -> Result<Vec<Sentence>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.document_id, s.section_id, s.ordinal, s.content,
                        s.label, s.rationale, s.classification_error
                 FROM sentences s
                 LEFT JOIN sections c ON c.id = s.section_id
                 WHERE s.document_id = ?1
                 ORDER BY COALESCE(c.ordinal, 4294967295), s.ordinal",
            )
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

        let sentences = stmt
            .query_map(params![document_id.to_string()], row_to_sentence)
            .map_err(|e| Error::storage(format!("Failed to list sentences: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::storage(format!("Failed to read sentence: {}", e)))?;

        Ok(sentences)
    }

    pub fn write_classifications(&self, results: &[SentenceClassification]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

        for result in results {
            let id = result.sentence_id.to_string();
            let updated = match &result.outcome {
                ClassificationOutcome::Labeled(classification) => tx.execute(
                    "UPDATE sentences SET label = ?2, rationale = ?3, classification_error = NULL
                     WHERE id = ?1",
                    params![id, classification.label, classification.rationale],
                ),
                ClassificationOutcome::Failed(message) => tx.execute(
                    "UPDATE sentences SET classification_error = ?2 WHERE id = ?1",
                    params![id, message],
                ),
            }
            .map_err(|e| Error::storage(format!("Failed to save classification: {}", e)))?;

            if updated == 0 {
                return Err(Error::storage(format!("Sentence {} does not exist", id)));
            }
        }

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit classifications: {}", e)))
    }

    pub fn count_rows(&self, document_id: Uuid, query: CountQuery) -> Result<usize> {
        let sql = match query {
            CountQuery::Sections => "SELECT COUNT(*) FROM sections WHERE document_id = ?1",
            CountQuery::Sentences => "SELECT COUNT(*) FROM sentences WHERE document_id = ?1",
            CountQuery::OrphanSentences => {
                "SELECT COUNT(*) FROM sentences s WHERE s.document_id = ?1
                 AND NOT EXISTS (SELECT 1 FROM sections c WHERE c.id = s.section_id)"
            }
            CountQuery::EmptySections => {
                "SELECT COUNT(*) FROM sections WHERE document_id = ?1 AND TRIM(content) = ''"
            }
            CountQuery::EmptySentences => {
                "SELECT COUNT(*) FROM sentences WHERE document_id = ?1 AND TRIM(content) = ''"
            }
            CountQuery::ClassifiedSentences => {
                "SELECT COUNT(*) FROM sentences WHERE document_id = ?1 AND label IS NOT NULL"
            }
        };

        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(sql, params![document_id.to_string()], |row| row.get(0))
            .map_err(|e| Error::storage(format!("Failed to count {:?}: {}", query, e)))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_document(&self, document_id: Uuid) -> Result<Option<Document>> {
        self.blocking(move |db| db.fetch_document(document_id)).await
    }

    async fn put_document(&self, document: &Document) -> Result<()> {
        let document = document.clone();
        self.blocking(move |db| db.write_document(&document)).await
    }

    async fn set_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()> {
        self.blocking(move |db| db.advance_stage(document_id, stage))
            .await
    }

    async fn rewind_stage(&self, document_id: Uuid, stage: PipelineStage) -> Result<()> {
        self.blocking(move |db| db.rewind(document_id, stage)).await
    }

    async fn set_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.blocking(move |db| db.write_status(document_id, status, error.as_deref()))
            .await
    }

    async fn save_structure(&self, document_id: Uuid, structure: &ParsedStructure) -> Result<()> {
        let payload = serde_json::to_string(structure)?;
        self.blocking(move |db| db.write_structure(document_id, &payload))
            .await
    }

    async fn load_structure(&self, document_id: Uuid) -> Result<Option<String>> {
        self.blocking(move |db| db.fetch_structure(document_id)).await
    }

    async fn upsert_sections(&self, sections: &[Section]) -> Result<()> {
        let sections = sections.to_vec();
        self.blocking(move |db| db.write_sections(&sections)).await
    }

    async fn upsert_sentences(&self, sentences: &[Sentence]) -> Result<()> {
        let sentences = sentences.to_vec();
        self.blocking(move |db| db.write_sentences(&sentences)).await
    }

    async fn list_sentences(&self, document_id: Uuid) -> Result<Vec<Sentence>> {
        self.blocking(move |db| db.fetch_sentences(document_id)).await
    }

    async fn save_classifications(&self, results: &[SentenceClassification]) -> Result<()> {
        let results = results.to_vec();
        self.blocking(move |db| db.write_classifications(&results))
            .await
    }

    async fn count(&self, document_id: Uuid, query: CountQuery) -> Result<usize> {
        self.blocking(move |db| db.count_rows(document_id, query)).await
    }
}

impl TaskJournal for SqliteStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (id, status, created_at, record) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                record = excluded.record",
            params![
                record.id.to_string(),
                record.status.as_str(),
                record.created_at.to_rfc3339(),
                json
            ],
        )
        .map_err(|e| Error::storage(format!("Failed to save task: {}", e)))?;
        Ok(())
    }

    fn remove_task(&self, task_id: &TaskId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id.to_string()])
            .map_err(|e| Error::storage(format!("Failed to remove task: {}", e)))?;
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, record FROM tasks ORDER BY created_at")
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| Error::storage(format!("Failed to load tasks: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::storage(format!("Failed to read task: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match serde_json::from_str::<TaskRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable task {}: {}", id, e),
            }
        }
        Ok(records)
    }
}

fn parse_uuid(value: &str, column: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let id: String = row.get(0)?;
    let storage_path: Option<String> = row.get(4)?;
    let stage: String = row.get(6)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Document {
        id: parse_uuid(&id, 0)?,
        owner: row.get(1)?,
        filename: row.get(2)?,
        content_hash: row.get(3)?,
        storage_path: storage_path.map(PathBuf::from),
        language: row.get(5)?,
        stage: PipelineStage::parse(&stage).unwrap_or_default(),
        status: DocumentStatus::parse(&status).unwrap_or_default(),
        error: row.get(8)?,
        created_at: parse_time(&created_at, 9)?,
        updated_at: parse_time(&updated_at, 10)?,
    })
}

fn row_to_sentence(row: &rusqlite::Row) -> rusqlite::Result<Sentence> {
    let id: String = row.get(0)?;
    let document_id: String = row.get(1)?;
    let section_id: String = row.get(2)?;

    Ok(Sentence {
        id: parse_uuid(&id, 0)?,
        document_id: parse_uuid(&document_id, 1)?,
        section_id: parse_uuid(&section_id, 2)?,
        ordinal: row.get(3)?,
        content: row.get(4)?,
        label: row.get(5)?,
        rationale: row.get(6)?,
        classification_error: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use crate::types::{Classification, DocumentJob, SubmitRequest, TaskPayload, TaskStatus};

    fn section(document_id: Uuid, ordinal: u32, content: &str) -> Section {
        Section {
            id: Section::derive_id(document_id, ordinal),
            document_id,
            ordinal,
            title: None,
            content: content.to_string(),
            page: None,
        }
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_stages() {
        let db = SqliteStore::in_memory().unwrap();
        let document = Document::new("notes.docx").with_storage_path("/tmp/notes.docx");
        db.put_document(&document).await.unwrap();

        db.set_stage(document.id, PipelineStage::StructureParsed)
            .await
            .unwrap();
        assert!(db
            .set_stage(document.id, PipelineStage::Classified)
            .await
            .is_err());

        let stored = db.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.filename, "notes.docx");
        assert_eq!(stored.stage, PipelineStage::StructureParsed);
        assert_eq!(stored.storage_path, Some(PathBuf::from("/tmp/notes.docx")));

        db.set_status(document.id, DocumentStatus::Failed, Some("parser down".to_string()))
            .await
            .unwrap();
        let stored = db.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("parser down"));
    }

    #[tokio::test]
    async fn test_counts_and_classifications() {
        let db = SqliteStore::in_memory().unwrap();
        let document = Document::new("a.pdf");
        let id = document.id;
        db.put_document(&document).await.unwrap();

        let intro = section(id, 0, "One. Two.");
        let blank = section(id, 1, "  ");
        db.upsert_sections(&[intro.clone(), blank]).await.unwrap();
        db.upsert_sentences(&[
            Sentence::new(id, intro.id, 0, "One."),
            Sentence::new(id, intro.id, 1, "Two."),
            Sentence::new(id, Uuid::new_v4(), 0, "Stray."),
        ])
        .await
        .unwrap();

        assert_eq!(db.count(id, CountQuery::Sections).await.unwrap(), 2);
        assert_eq!(db.count(id, CountQuery::Sentences).await.unwrap(), 3);
        assert_eq!(db.count(id, CountQuery::OrphanSentences).await.unwrap(), 1);
        assert_eq!(db.count(id, CountQuery::EmptySections).await.unwrap(), 1);

        let sentences = db.list_sentences(id).await.unwrap();
        assert_eq!(sentences[0].content, "One.");
        db.save_classifications(&[
            SentenceClassification {
                sentence_id: sentences[0].id,
                outcome: ClassificationOutcome::Labeled(Classification {
                    label: "fact".to_string(),
                    rationale: Some("states a number".to_string()),
                }),
            },
            SentenceClassification {
                sentence_id: sentences[1].id,
                outcome: ClassificationOutcome::Failed("classifier timeout".to_string()),
            },
        ])
        .await
        .unwrap();

        assert_eq!(db.count(id, CountQuery::ClassifiedSentences).await.unwrap(), 1);
        let sentences = db.list_sentences(id).await.unwrap();
        assert_eq!(sentences[0].label.as_deref(), Some("fact"));
        assert_eq!(
            sentences[1].classification_error.as_deref(),
            Some("classifier timeout")
        );

        // Re-upserting segmentation output keeps labels
        db.upsert_sentences(&[Sentence::new(id, intro.id, 0, "One.")])
            .await
            .unwrap();
        assert_eq!(db.count(id, CountQuery::ClassifiedSentences).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrich.db");

        let task_id = {
            let db = Arc::new(SqliteStore::new(&path).unwrap());
            let scheduler = Scheduler::with_journal(SchedulerConfig::default(), db);
            let id = scheduler.submit(SubmitRequest::new(TaskPayload::ProcessDocument(
                DocumentJob::new(Uuid::new_v4()),
            )));
            scheduler.next().unwrap();
            id
        };

        let db = SqliteStore::new(&path).unwrap();
        let records = db.load_tasks().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, task_id);
        assert_eq!(records[0].status, TaskStatus::Processing);

        let scheduler = Scheduler::new(SchedulerConfig::default());
        assert_eq!(scheduler.restore(records), 1);
        assert_eq!(scheduler.next().unwrap().id, task_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_journal_writes_on_worker_threads() {
        let db = Arc::new(SqliteStore::in_memory().unwrap());
        let scheduler = Arc::new(Scheduler::with_journal(SchedulerConfig::default(), db.clone()));

        let submits = (0..8).map(|_| {
            let scheduler = scheduler.clone();
            let db = db.clone();
            tokio::spawn(async move {
                let document = Document::new("batch.pdf");
                db.put_document(&document).await.unwrap();
                scheduler.submit(SubmitRequest::new(TaskPayload::ProcessDocument(
                    DocumentJob::new(document.id),
                )))
            })
        });
        let ids: Vec<_> = futures::future::join_all(submits)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let records = db.load_tasks().unwrap();
        assert_eq!(records.len(), ids.len());
        assert!(records.iter().all(|r| ids.contains(&r.id)));
    }
}
