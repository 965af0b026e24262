//! Configuration for the enrichment pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Queue defaults and retention
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Worker pool sizing and backoff
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Stage behaviour
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Consistency thresholds
    #[serde(default)]
    pub verifier: VerifierConfig,
    /// Persistence
    #[serde(default)]
    pub storage: StorageConfig,
    /// Enrichment collaborator endpoints
    #[serde(default)]
    pub providers: ProviderConfig,
}

impl EnrichConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retries allowed when the submission does not say
    pub default_max_retries: u32,
    /// Handler timeout when the submission does not say (default: 1800 = 30 minutes)
    pub default_timeout_secs: u64,
    /// How long terminal tasks stay queryable (default: 7 days)
    pub retention_secs: u64,
    /// How often the reaper runs
    pub reap_interval_secs: u64,
    /// Error codes that refuse a manual retry
    pub permanent_error_codes: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_timeout_secs: 1800,
            retention_secs: 7 * 24 * 60 * 60,
            reap_interval_secs: 300,
            permanent_error_codes: vec![
                "source_missing".to_string(),
                "invalid_payload".to_string(),
                "document_not_found".to_string(),
                "handler_not_found".to_string(),
                "parser_rejected".to_string(),
            ],
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers (default: CPU count, max 4)
    pub worker_count: Option<usize>,
    /// Sleep when the queue is empty
    pub poll_interval_ms: u64,
    /// Backoff unit: the n-th retry waits base * multiplier^n
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    /// Backoff ceiling
    pub max_backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: None, // Auto-detect from CPU count
            poll_interval_ms: 250,
            backoff_base_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count
            .unwrap_or_else(|| num_cpus::get().min(4))
            .max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Primary upload location: `<upload_dir>/<document_id>/<filename>`
    pub upload_dir: PathBuf,
    /// Flat directories used by older upload layouts: `<dir>/<filename>`
    pub legacy_dirs: Vec<PathBuf>,
    /// Roots searched by content hash as a last resort
    pub hash_search_roots: Vec<PathBuf>,
    /// Concurrent segmentation calls per document
    pub segment_concurrency: usize,
    /// Concurrent classifier calls per document, independent of worker count
    pub classify_concurrency: usize,
    /// Fraction of sentences failing for availability reasons (network,
    /// 5xx, timeout) that marks a classification pass as an outage
    pub classifier_outage_ratio: f64,
    /// Availability failures needed before the ratio applies, unless every
    /// sentence failed
    pub classifier_outage_min_failures: usize,
    /// Language used when neither the job nor the document has one
    pub default_language: String,
    /// Delete the source artifact once verification passes
    pub delete_source_on_success: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("data/uploads"),
            legacy_dirs: Vec::new(),
            hash_search_roots: Vec::new(),
            segment_concurrency: 4,
            classify_concurrency: 8,
            classifier_outage_ratio: 0.5,
            classifier_outage_min_failures: 3,
            default_language: "en".to_string(),
            delete_source_on_success: true,
        }
    }
}

/// Consistency verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Smallest acceptable serialized `metadata` object from the parser
    pub min_metadata_bytes: usize,
    /// Sentences pointing at a missing section, as a fraction of all sentences
    pub max_orphan_ratio: f64,
    /// Empty sections and sentences, as a fraction of all of them
    pub max_empty_ratio: f64,
    /// Reads before concluding failure
    pub read_attempts: u32,
    /// Sleep between reads
    pub read_backoff_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            min_metadata_bytes: 32,
            max_orphan_ratio: 0.01,
            max_empty_ratio: 0.2,
            read_attempts: 3,
            read_backoff_ms: 200,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/enrich.db"),
        }
    }
}

/// Enrichment collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Structural parser endpoint (multipart upload)
    pub parser_url: String,
    /// Segmentation endpoint (JSON)
    pub segmenter_url: String,
    /// Classifier endpoint (JSON, one sentence per call)
    pub classifier_url: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            parser_url: "http://localhost:8001/parse".to_string(),
            segmenter_url: "http://localhost:8002/segment".to_string(),
            classifier_url: "http://localhost:8003/classify".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EnrichConfig::from_toml(
            r#"
            [workers]
            worker_count = 2

            [pipeline]
            classify_concurrency = 3
            legacy_dirs = ["/srv/old-uploads"]
            "#,
        )
        .unwrap();

        assert_eq!(config.workers.resolved_worker_count(), 2);
        assert_eq!(config.workers.backoff_base_ms, 1000);
        assert_eq!(config.pipeline.classify_concurrency, 3);
        assert_eq!(config.pipeline.legacy_dirs, vec![PathBuf::from("/srv/old-uploads")]);
        assert_eq!(config.scheduler.default_max_retries, 3);
        assert!(config
            .scheduler
            .permanent_error_codes
            .contains(&"source_missing".to_string()));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EnrichConfig::from_toml("workers = 3").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
