//! Pipeline value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A media attachment reference from the messaging provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub content_type: String,
}

/// Document content types the extraction capability accepts.
const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

impl MediaRef {
    pub fn is_image(&self) -> bool {
        self.content_type.to_lowercase().starts_with("image/")
    }

    pub fn is_document(&self) -> bool {
        let lowered = self.content_type.to_lowercase();
        DOCUMENT_TYPES.iter().any(|t| *t == lowered)
    }
}

/// One webhook delivery, immutable once received.
///
/// `id` is the provider-assigned message id and doubles as the idempotency
/// key: the same id is never processed twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    /// Normalized sender phone number (`+<country><number>`).
    pub sender: String,
    pub body: String,
    pub media: Vec<MediaRef>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

/// The fixed set of capability handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Extraction,
    Retrieval,
    Search,
    Vision,
    Conversation,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Retrieval => "retrieval",
            Self::Search => "search",
            Self::Vision => "vision",
            Self::Conversation => "conversation",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transient output of one capability handler.
#[derive(Debug, Clone, Default)]
pub struct CapabilityResult {
    /// User-facing text contribution ("" for context-only results).
    pub text: String,
    /// Safety warnings raised by the handler itself.
    pub warnings: Vec<String>,
    /// Whether the handler itself flagged an emergency.
    pub emergency: bool,
    /// Optional media to attach to the outbound reply.
    pub media: Option<MediaRef>,
}

impl CapabilityResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Pre-safety-check composed reply.
#[derive(Debug, Clone)]
pub struct DraftReply {
    pub text: String,
    /// Capabilities that contributed, in invocation order.
    pub handlers: Vec<Capability>,
    /// Warnings raised by the handlers themselves (merged ahead of the
    /// safety validator's own warnings).
    pub warnings: Vec<String>,
    /// True when a context-only capability failed and the reply notes the
    /// missing reference material.
    pub degraded: bool,
    /// Optional media to attach.
    pub media: Option<MediaRef>,
}
