//! Enrichment collaborators: structural parser, segmenter, classifier
//!
//! The pipeline depends on these traits only. HTTP implementations talk to
//! the external services.

mod http;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::types::{Classification, Document, ParsedStructure};

pub use http::{HttpClassifier, HttpSegmenter, HttpStructuralParser};

/// Turns a source file into structured metadata and ordered raw sections.
///
/// A file the parser refuses must surface as `Error::ParserRejected`
/// (permanent); unavailability as a transient error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StructuralParser: Send + Sync {
    async fn parse(&self, document: &Document, path: &Path) -> Result<ParsedStructure>;
}

/// Splits section text into ordered sentences
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, text: &str, language: &str) -> Result<Vec<String>>;
}

/// Labels a single sentence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, sentence: &str) -> Result<Classification>;
}

/// The three collaborators the pipeline calls
#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn StructuralParser>,
    pub segmenter: Arc<dyn Segmenter>,
    pub classifier: Arc<dyn Classifier>,
}

impl Collaborators {
    /// HTTP clients for every configured endpoint
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            parser: Arc::new(HttpStructuralParser::new(config)?),
            segmenter: Arc::new(HttpSegmenter::new(config)?),
            classifier: Arc::new(HttpClassifier::new(config)?),
        })
    }
}
