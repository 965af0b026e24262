//! HTTP clients for the enrichment services

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::types::{Classification, Document, ParsedStructure};

use super::{Classifier, Segmenter, StructuralParser};

fn build_client(config: &ProviderConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Map a failed response to a collaborator error. Only the parser treats
/// 4xx as a verdict on the input.
fn status_error(collaborator: &'static str, status: StatusCode, body: &str) -> Error {
    Error::collaborator(collaborator, format!("{} - {}", status, truncate(body, 512)))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Structural parser behind a multipart upload endpoint
pub struct HttpStructuralParser {
    client: Client,
    url: String,
}

impl HttpStructuralParser {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.parser_url.clone(),
        })
    }
}

#[async_trait]
impl StructuralParser for HttpStructuralParser {
    async fn parse(&self, document: &Document, path: &Path) -> Result<ParsedStructure> {
        let data = tokio::fs::read(path).await?;
        let size = data.len();

        let form = reqwest::multipart::Form::new()
            .text("document_id", document.id.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(data).file_name(document.filename.clone()),
            );

        tracing::debug!("[{}] Uploading {} bytes to parser", document.filename, size);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::collaborator("parser", format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::ParserRejected {
                    filename: document.filename.clone(),
                    message: format!("{} - {}", status, truncate(&body, 512)),
                });
            }
            return Err(status_error("parser", status, &body));
        }

        response
            .json::<ParsedStructure>()
            .await
            .map_err(|e| Error::collaborator("parser", format!("invalid response: {}", e)))
    }
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    text: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct SegmentResponse {
    sentences: Vec<String>,
}

/// Segmentation service client
pub struct HttpSegmenter {
    client: Client,
    url: String,
}

impl HttpSegmenter {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.segmenter_url.clone(),
        })
    }
}

#[async_trait]
impl Segmenter for HttpSegmenter {
    async fn segment(&self, text: &str, language: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(&SegmentRequest { text, language })
            .send()
            .await
            .map_err(|e| Error::collaborator("segmenter", format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("segmenter", status, &body));
        }

        let parsed: SegmentResponse = response
            .json()
            .await
            .map_err(|e| Error::collaborator("segmenter", format!("invalid response: {}", e)))?;
        Ok(parsed.sentences)
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    sentence: &'a str,
}

/// Classifier service client, one sentence per request
pub struct HttpClassifier {
    client: Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.classifier_url.clone(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, sentence: &str) -> Result<Classification> {
        let response = self
            .client
            .post(&self.url)
            .json(&ClassifyRequest { sentence })
            .send()
            .await
            .map_err(|e| Error::collaborator("classifier", format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classifier_status_error(status, &body));
        }

        // An unparseable label is about this sentence, not the service
        response
            .json::<Classification>()
            .await
            .map_err(|e| Error::ClassificationRejected(format!("invalid response: {}", e)))
    }
}

/// 4xx other than 429 is a verdict on the sentence; the rest is availability
fn classifier_status_error(status: StatusCode, body: &str) -> Error {
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        return Error::ClassificationRejected(format!("{} - {}", status, truncate(body, 512)));
    }
    status_error("classifier", status, body)
}
