//! Source artifact lookup over an ordered list of candidate locations
//!
//! Order: the path recorded on the document, the per-document upload
//! directory, flat legacy directories, then a content-hash search.

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::types::Document;

/// Which candidate produced the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLocation {
    Primary,
    Legacy,
    ContentHash,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceLocation::Primary => "primary",
            SourceLocation::Legacy => "legacy",
            SourceLocation::ContentHash => "content-hash",
        })
    }
}

/// A located source artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub path: PathBuf,
    pub location: SourceLocation,
}

/// Finds a document's source file
#[derive(Debug, Clone)]
pub struct SourceResolver {
    upload_dir: PathBuf,
    legacy_dirs: Vec<PathBuf>,
    hash_search_roots: Vec<PathBuf>,
}

impl SourceResolver {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            legacy_dirs: config.legacy_dirs.clone(),
            hash_search_roots: config.hash_search_roots.clone(),
        }
    }

    /// Path-based candidates in lookup order
    pub fn candidates(&self, document: &Document) -> Vec<(SourceLocation, PathBuf)> {
        let mut candidates = Vec::new();
        if let Some(path) = &document.storage_path {
            candidates.push((SourceLocation::Primary, path.clone()));
        }

        // Only the final component of the uploaded name is trusted
        let Some(name) = Path::new(&document.filename).file_name() else {
            return candidates;
        };

        candidates.push((
            SourceLocation::Primary,
            self.upload_dir.join(document.id.to_string()).join(name),
        ));
        for dir in &self.legacy_dirs {
            candidates.push((SourceLocation::Legacy, dir.join(name)));
        }
        candidates
    }

    /// Locate the source file. A miss is a permanent error.
    pub async fn resolve(&self, document: &Document) -> Result<ResolvedSource> {
        let mut tried = Vec::new();

        for (location, path) in self.candidates(document) {
            if tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                tracing::debug!("[{}] Source found at {} ({})", document.id, path.display(), location);
                return Ok(ResolvedSource { path, location });
            }
            tried.push(path.display().to_string());
        }

        if let Some(hash) = &document.content_hash {
            if !self.hash_search_roots.is_empty() {
                let roots = self.hash_search_roots.clone();
                let wanted = hash.to_lowercase();
                let found = tokio::task::spawn_blocking(move || find_by_hash(&roots, &wanted))
                    .await
                    .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?;

                if let Some(path) = found {
                    tracing::info!(
                        "[{}] Source recovered by content hash at {}",
                        document.id,
                        path.display()
                    );
                    return Ok(ResolvedSource {
                        path,
                        location: SourceLocation::ContentHash,
                    });
                }
                tried.push(format!("sha256:{}", hash));
            }
        }

        Err(Error::SourceMissing {
            document_id: document.id,
            tried: tried.join(", "),
        })
    }

    /// Copy a caller's file into the document's upload directory. The copy
    /// becomes the source the pipeline may delete; `source` is left alone.
    pub async fn stage_upload(&self, document: &Document, source: &Path) -> Result<PathBuf> {
        let name = Path::new(&document.filename).file_name().ok_or_else(|| {
            Error::internal(format!("Document {} has no usable file name", document.id))
        })?;
        let folder = self.upload_dir.join(document.id.to_string());
        tokio::fs::create_dir_all(&folder).await?;

        let target = folder.join(name);
        tokio::fs::copy(source, &target).await?;
        tracing::debug!(
            "[{}] Staged {} at {}",
            document.id,
            source.display(),
            target.display()
        );
        Ok(target)
    }

    /// Remove the source file; an already-missing file is not an error
    pub async fn delete(&self, source: &ResolvedSource) -> Result<()> {
        match tokio::fs::remove_file(&source.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hex SHA-256 of a file, streamed
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn find_by_hash(roots: &[PathBuf], wanted: &str) -> Option<PathBuf> {
    for root in roots {
        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            match hash_file(entry.path()) {
                Ok(hash) if hash == wanted => return Some(entry.into_path()),
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping {}: {}", entry.path().display(), e),
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(dir: &Path) -> SourceResolver {
        SourceResolver::new(&PipelineConfig {
            upload_dir: dir.join("uploads"),
            legacy_dirs: vec![dir.join("legacy")],
            hash_search_roots: vec![dir.join("archive")],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_primary_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let document = Document::new("report.pdf");
        let upload = dir.path().join("uploads").join(document.id.to_string());
        std::fs::create_dir_all(&upload).unwrap();
        std::fs::write(upload.join("report.pdf"), b"%PDF").unwrap();

        let source = resolver(dir.path()).resolve(&document).await.unwrap();
        assert_eq!(source.location, SourceLocation::Primary);
    }

    #[tokio::test]
    async fn test_legacy_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("legacy")).unwrap();
        std::fs::write(dir.path().join("legacy").join("old.docx"), b"data").unwrap();

        let source = resolver(dir.path())
            .resolve(&Document::new("old.docx"))
            .await
            .unwrap();
        assert_eq!(source.location, SourceLocation::Legacy);
    }

    #[tokio::test]
    async fn test_content_hash_fallback_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive").join("2023");
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::write(archive.join("renamed.bin"), b"original bytes").unwrap();
        std::fs::write(archive.join("other.bin"), b"something else").unwrap();

        let hash = hash_file(&archive.join("renamed.bin")).unwrap();
        let document = Document::new("lost.pdf").with_content_hash(hash.to_uppercase());

        let resolver = resolver(dir.path());
        let source = resolver.resolve(&document).await.unwrap();
        assert_eq!(source.location, SourceLocation::ContentHash);
        assert_eq!(source.path, archive.join("renamed.bin"));

        resolver.delete(&source).await.unwrap();
        assert!(!source.path.exists());
        // Deleting twice is fine
        resolver.delete(&source).await.unwrap();
    }

    #[tokio::test]
    async fn test_staged_copy_is_deleted_not_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("mine.pdf");
        std::fs::write(&original, b"%PDF-1.7 keep me").unwrap();

        let resolver = resolver(dir.path());
        let document = Document::new("mine.pdf");
        let staged = resolver.stage_upload(&document, &original).await.unwrap();
        assert!(staged.starts_with(dir.path().join("uploads").join(document.id.to_string())));

        let document = document.with_storage_path(&staged);
        let source = resolver.resolve(&document).await.unwrap();
        assert_eq!(source.path, staged);
        resolver.delete(&source).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&original).unwrap(), b"%PDF-1.7 keep me");
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let document = Document::new("ghost.pdf").with_content_hash("00ff");

        let err = resolver(dir.path()).resolve(&document).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.code(), "source_missing");
        assert!(err.to_string().contains("sha256:00ff"));
    }

    #[test]
    fn test_filename_traversal_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let document = Document::new("../../etc/passwd");
        let candidates = resolver(dir.path()).candidates(&document);
        assert!(candidates
            .iter()
            .all(|(_, path)| path.starts_with(dir.path())));
    }
}
