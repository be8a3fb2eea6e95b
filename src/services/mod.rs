//! External collaborator contracts.
//!
//! The pipeline only ever sees these traits; the concrete implementations
//! (LLM, web search, vector search, multimodal vision) live in the
//! submodules and are swapped for mocks in tests.

pub mod language;
pub mod retrieval;
pub mod search;
pub mod synthesis;
pub mod vision;

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::pipeline::types::MediaRef;
use crate::profile::UserProfile;
use crate::store::ChatTurn;

pub use language::LlmLanguageService;
pub use retrieval::PineconeRetrieval;
pub use search::SerperSearch;
pub use synthesis::LlmSynthesis;
pub use vision::HttpVisionService;

/// Language detection and translation.
#[async_trait]
pub trait LanguageService: Send + Sync {
    /// Detect the language of `text`, returning a supported language code.
    async fn detect(&self, text: &str) -> Result<String, CapabilityError>;

    /// Translate `text` between two supported languages.
    async fn translate(&self, text: &str, from: &str, to: &str)
        -> Result<String, CapabilityError>;
}

/// One ranked passage from the knowledge store.
#[derive(Debug, Clone)]
pub struct Passage {
    pub text: String,
    pub score: f64,
    pub source: Option<String>,
}

/// Vector-search knowledge store.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Query a namespace for passages relevant to `text`.
    async fn query(
        &self,
        text: &str,
        namespace: &str,
        top_k: usize,
    ) -> Result<Vec<Passage>, CapabilityError>;

    /// Index a document chunk into a namespace.
    async fn index(&self, namespace: &str, id: &str, text: &str)
        -> Result<(), CapabilityError>;

    /// Erase an entire namespace (profile deletion).
    async fn erase_namespace(&self, namespace: &str) -> Result<(), CapabilityError>;
}

/// One web-search result.
#[derive(Debug, Clone)]
pub struct SearchSnippet {
    pub title: String,
    pub snippet: String,
    pub link: String,
}

/// Live web search.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(
        &self,
        query: &str,
        location_hint: Option<&str>,
    ) -> Result<Vec<SearchSnippet>, CapabilityError>;
}

/// What kind of image the user sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// A skin/dermatological photo.
    SkinPhoto,
    /// A medical report or document photo.
    DocumentReport,
    Other,
}

/// Structured fields extracted from a medical document.
#[derive(Debug, Clone, Default)]
pub struct DocumentFindings {
    pub summary: String,
    pub conditions: Vec<String>,
    pub medications: Vec<String>,
}

impl DocumentFindings {
    /// Flattened text for indexing into the per-user retrieval namespace.
    pub fn indexable_text(&self) -> String {
        let mut text = self.summary.clone();
        if !self.conditions.is_empty() {
            text.push_str("\nConditions: ");
            text.push_str(&self.conditions.join(", "));
        }
        if !self.medications.is_empty() {
            text.push_str("\nMedications: ");
            text.push_str(&self.medications.join(", "));
        }
        text
    }
}

/// Vision and document analysis.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// Classify an inbound image so the router can pick a capability.
    async fn classify(&self, media: &MediaRef) -> Result<MediaKind, CapabilityError>;

    /// Analyze a skin photo in the context of the user's profile.
    async fn analyze_skin(
        &self,
        media: &MediaRef,
        profile_summary: &str,
    ) -> Result<String, CapabilityError>;

    /// Extract structured findings from a medical report or document image.
    async fn extract_document(&self, media: &MediaRef)
        -> Result<DocumentFindings, CapabilityError>;
}

/// Final conversational answer synthesis.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    async fn respond(
        &self,
        question: &str,
        context: &str,
        profile: &UserProfile,
        history: &[ChatTurn],
    ) -> Result<String, CapabilityError>;
}

/// Map an LLM failure into a capability failure.
pub(crate) fn llm_failure(name: &str, err: crate::error::LlmError) -> CapabilityError {
    CapabilityError::Failed {
        name: name.to_string(),
        reason: err.to_string(),
    }
}
