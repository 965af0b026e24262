//! Document enrichment pipeline
//!
//! - `resolver`: finds a document's source artifact
//! - `orchestrator`: the resumable stage runner registered as a task handler
//! - `verifier`: consistency checks before a document is marked complete

mod orchestrator;
mod resolver;
mod verifier;

pub use orchestrator::{PipelineOrchestrator, PipelineOutcome};
pub use resolver::{hash_file, ResolvedSource, SourceLocation, SourceResolver};
pub use verifier::{ConsistencyVerifier, VerificationReport};
