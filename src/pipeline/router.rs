//! Message classifier and capability router.
//!
//! Inspects a gate-passed inbound event and produces an ordered capability
//! plan, then executes it. Every collaborator call is bounded by the
//! configured timeout; a failed call is retried once with unchanged input,
//! and a second failure substitutes a fixed fallback so one failing
//! capability never aborts the others.

use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::CapabilityError;
use crate::pipeline::types::{Capability, CapabilityResult, DraftReply, InboundEvent, MediaRef};
use crate::profile::UserProfile;
use crate::services::retrieval::user_namespace;
use crate::services::{
    MediaKind, Passage, RetrievalService, SearchService, SearchSnippet, SynthesisService,
    VisionService,
};
use crate::store::ChatTurn;

/// Fixed fallback substituted when a user-facing capability fails twice.
pub const FALLBACK_TEXT: &str = "unable to process this request, please try again";

/// Neutral note appended when context-only retrieval was unavailable.
pub const DEGRADED_NOTE: &str = "Note: some reference material was unavailable for this answer.";

/// Fixed acknowledgment for a document upload with no accompanying question.
const DOCUMENT_ACK: &str = "Document processed successfully. I've saved the key details from \
your report and will use them to personalize future advice. You can now ask me questions \
about it.";

/// Disease/outbreak terms that trigger the live search capability.
const OUTBREAK_KEYWORDS: &[&str] = &[
    "outbreak",
    "epidemic",
    "dengue",
    "malaria",
    "chikungunya",
    "cholera",
    "typhoid",
    "covid",
    "influenza",
    "swine flu",
    "bird flu",
    "nipah",
    "zika",
    "measles",
    "leptospirosis",
    "jaundice cases",
    "tuberculosis",
];

/// Leading words that mark a sentence as a question even without '?'.
const QUESTION_WORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "which", "who", "should", "can", "could", "is",
    "are", "does", "do", "will",
];

/// The five capability handlers, behind their collaborator traits.
#[derive(Clone)]
pub struct CapabilitySet {
    pub retrieval: Arc<dyn RetrievalService>,
    pub search: Arc<dyn SearchService>,
    pub vision: Arc<dyn VisionService>,
    pub synthesis: Arc<dyn SynthesisService>,
}

/// Classifies inbound events and runs the selected capabilities.
pub struct QueryRouter {
    services: CapabilitySet,
    config: PipelineConfig,
    global_namespace: String,
}

impl QueryRouter {
    pub fn new(services: CapabilitySet, config: PipelineConfig, global_namespace: String) -> Self {
        Self {
            services,
            config,
            global_namespace,
        }
    }

    /// Produce the ordered capability plan for an event.
    ///
    /// Decision policy:
    /// - skin photo → Vision only
    /// - document or report image → Extraction, plus Retrieval+Conversation
    ///   when a question accompanies the upload
    /// - outbreak keyword with a location (explicit or profile) → Search
    /// - otherwise → Retrieval then Conversation
    pub async fn plan(&self, event: &InboundEvent, profile: &UserProfile) -> Vec<Capability> {
        if let Some(image) = event.media.iter().find(|m| m.is_image()) {
            let kind = self.classify_image(image).await;
            if kind == MediaKind::SkinPhoto {
                return vec![Capability::Vision];
            }
            return self.extraction_plan(&event.body);
        }

        if event.media.iter().any(|m| m.is_document()) {
            return self.extraction_plan(&event.body);
        }

        if outbreak_intent(&event.body) && search_location(&event.body, profile).is_some() {
            return vec![Capability::Search];
        }

        vec![Capability::Retrieval, Capability::Conversation]
    }

    fn extraction_plan(&self, body: &str) -> Vec<Capability> {
        if has_question(body) {
            vec![
                Capability::Extraction,
                Capability::Retrieval,
                Capability::Conversation,
            ]
        } else {
            vec![Capability::Extraction]
        }
    }

    /// Execute a plan and merge the results into a draft reply.
    ///
    /// Results are concatenated in invocation order; retrieval and
    /// extraction always precede conversation because the plan orders them
    /// that way, and their outputs feed conversation synthesis as context.
    pub async fn execute(
        &self,
        plan: &[Capability],
        event: &InboundEvent,
        profile: &UserProfile,
        history: &[ChatTurn],
    ) -> DraftReply {
        let mut visible: Vec<String> = Vec::new();
        let mut context: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut degraded = false;

        for capability in plan {
            match capability {
                Capability::Vision => match self.run_vision(event, profile).await {
                    Ok(result) => merge_result(result, &mut visible, &mut warnings),
                    Err(e) => {
                        warn!(error = %e, "Vision capability failed after retry");
                        visible.push(FALLBACK_TEXT.to_string());
                    }
                },
                Capability::Extraction => match self.run_extraction(event).await {
                    Ok(result) => {
                        context.push(result.text.clone());
                        if has_question(&event.body) {
                            merge_result(result, &mut visible, &mut warnings);
                        } else {
                            visible.push(DOCUMENT_ACK.to_string());
                            warnings.extend(result.warnings);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Extraction capability failed after retry");
                        visible.push(FALLBACK_TEXT.to_string());
                    }
                },
                Capability::Retrieval => match self.run_retrieval(event, profile).await {
                    Ok(passages) => {
                        if !passages.is_empty() {
                            context.push(format_passages(&passages));
                        }
                    }
                    Err(e) => {
                        // Context-only: degrade the reply instead of
                        // substituting user-facing fallback text.
                        warn!(error = %e, "Retrieval capability failed after retry");
                        degraded = true;
                    }
                },
                Capability::Search => match self.run_search(event, profile).await {
                    Ok(result) => merge_result(result, &mut visible, &mut warnings),
                    Err(e) => {
                        warn!(error = %e, "Search capability failed after retry");
                        visible.push(FALLBACK_TEXT.to_string());
                    }
                },
                Capability::Conversation => {
                    let joined_context = context.join("\n\n");
                    match self
                        .run_conversation(event, profile, &joined_context, history)
                        .await
                    {
                        Ok(result) => merge_result(result, &mut visible, &mut warnings),
                        Err(e) => {
                            warn!(error = %e, "Conversation capability failed after retry");
                            visible.push(FALLBACK_TEXT.to_string());
                        }
                    }
                }
            }
        }

        if degraded {
            visible.push(DEGRADED_NOTE.to_string());
        }

        info!(
            event_id = %event.id,
            handlers = ?plan.iter().map(Capability::name).collect::<Vec<_>>(),
            degraded,
            "Capability plan executed"
        );

        DraftReply {
            text: visible.join("\n\n"),
            handlers: plan.to_vec(),
            warnings,
            degraded,
            media: None,
        }
    }

    // ── Capability runners ──────────────────────────────────────────

    async fn run_vision(
        &self,
        event: &InboundEvent,
        profile: &UserProfile,
    ) -> Result<CapabilityResult, CapabilityError> {
        let media = first_image(event).ok_or_else(|| CapabilityError::Failed {
            name: "vision".into(),
            reason: "no image attached".into(),
        })?;
        let summary = profile.summary();
        let summary = summary.as_str();
        let analysis = self
            .attempt("vision", move || async move {
                self.services.vision.analyze_skin(media, summary).await
            })
            .await?;
        Ok(CapabilityResult::text(analysis))
    }

    async fn run_extraction(
        &self,
        event: &InboundEvent,
    ) -> Result<CapabilityResult, CapabilityError> {
        let media = event
            .media
            .iter()
            .find(|m| m.is_document() || m.is_image())
            .ok_or_else(|| CapabilityError::Failed {
                name: "extraction".into(),
                reason: "no document attached".into(),
            })?;

        let findings = self
            .attempt("extraction", move || async move {
                self.services.vision.extract_document(media).await
            })
            .await?;

        // Index for later retrieval. An indexing failure loses future
        // context but must not fail the turn.
        let namespace = user_namespace(&event.sender);
        if let Err(e) = self
            .services
            .retrieval
            .index(&namespace, &event.id, &findings.indexable_text())
            .await
        {
            warn!(error = %e, namespace, "Failed to index extracted document");
        }

        Ok(CapabilityResult::text(findings.summary))
    }

    async fn run_retrieval(
        &self,
        event: &InboundEvent,
        profile: &UserProfile,
    ) -> Result<Vec<Passage>, CapabilityError> {
        let top_k = 5usize;
        let query = event.body.as_str();
        let phone = profile.phone.as_str();
        let global_namespace = self.global_namespace.as_str();
        self.attempt("retrieval", move || async move {
            let mut passages = self
                .services
                .retrieval
                .query(query, global_namespace, top_k)
                .await?;
            // Per-user uploaded-document context; absence is normal.
            match self
                .services
                .retrieval
                .query(query, &user_namespace(phone), top_k)
                .await
            {
                Ok(user_passages) => passages.extend(user_passages),
                Err(e) => debug!(error = %e, "No user-namespace passages"),
            }
            passages.sort_by(|a, b| b.score.total_cmp(&a.score));
            passages.truncate(top_k);
            Ok(passages)
        })
        .await
    }

    async fn run_search(
        &self,
        event: &InboundEvent,
        profile: &UserProfile,
    ) -> Result<CapabilityResult, CapabilityError> {
        let topic = outbreak_topic(&event.body).unwrap_or_else(|| "disease outbreak".to_string());
        let location = search_location(&event.body, profile).unwrap_or_default();
        let query = format!("{topic} outbreak cases");
        let query_ref = query.as_str();
        let location_ref = location.as_str();

        let snippets = self
            .attempt("search", move || async move {
                self.services
                    .search
                    .search(query_ref, Some(location_ref))
                    .await
            })
            .await?;

        Ok(CapabilityResult::text(format_search_reply(
            &topic, &location, &snippets,
        )))
    }

    async fn run_conversation(
        &self,
        event: &InboundEvent,
        profile: &UserProfile,
        context: &str,
        history: &[ChatTurn],
    ) -> Result<CapabilityResult, CapabilityError> {
        let body = event.body.as_str();
        let answer = self
            .attempt("conversation", move || async move {
                self.services
                    .synthesis
                    .respond(body, context, profile, history)
                    .await
            })
            .await?;
        Ok(CapabilityResult::text(answer))
    }

    /// Classify an inbound image. A classification failure routes the image
    /// down the document path, which degrades gracefully.
    async fn classify_image(&self, media: &MediaRef) -> MediaKind {
        match self
            .bounded("vision.classify", self.services.vision.classify(media))
            .await
        {
            Ok(kind) => kind,
            Err(e) => {
                warn!(error = %e, "Image classification failed, assuming document");
                MediaKind::DocumentReport
            }
        }
    }

    // ── Timeout and retry plumbing ──────────────────────────────────

    /// Run a capability call once, bounded by the configured timeout.
    async fn bounded<T>(
        &self,
        name: &str,
        fut: impl Future<Output = Result<T, CapabilityError>>,
    ) -> Result<T, CapabilityError> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| CapabilityError::Timeout {
                name: name.to_string(),
                timeout: self.config.call_timeout,
            })?
    }

    /// Run a capability call with one retry on unchanged input.
    async fn attempt<T, Fut, F>(&self, name: &str, mut call: F) -> Result<T, CapabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        match self.bounded(name, call()).await {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(capability = name, error = %first, "Capability call failed, retrying once");
                let jitter_ms = rand::thread_rng().gen_range(100..400);
                tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                self.bounded(name, call()).await
            }
        }
    }
}

// ── Intent helpers ──────────────────────────────────────────────────

fn first_image(event: &InboundEvent) -> Option<&MediaRef> {
    event.media.iter().find(|m| m.is_image())
}

/// Fold one handler result into the visible parts and warning list.
fn merge_result(
    result: CapabilityResult,
    visible: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if !result.text.is_empty() {
        visible.push(result.text);
    }
    warnings.extend(result.warnings);
    if result.emergency {
        warnings.push("A handler flagged this as a possible emergency.".to_string());
    }
}

/// Whether the text reads as a direct question.
pub fn has_question(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.contains('?') {
        return true;
    }
    let first_word = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    QUESTION_WORDS.contains(&first_word.as_str())
}

/// Whether the text carries a disease/outbreak intent signal.
pub fn outbreak_intent(text: &str) -> bool {
    let lowered = text.to_lowercase();
    OUTBREAK_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

/// The first matched outbreak topic, for query construction.
fn outbreak_topic(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    OUTBREAK_KEYWORDS
        .iter()
        .find(|kw| lowered.contains(*kw))
        .map(|kw| (*kw).to_string())
}

/// The location to parameterize a search with: an explicit `in/at/near
/// <place>` mention wins, otherwise the user's stored district/state.
pub fn search_location(text: &str, profile: &UserProfile) -> Option<String> {
    static LOCATION_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = LOCATION_RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(?:in|at|near|around)\s+([A-Za-z][A-Za-z .-]{1,40})")
            .unwrap_or_else(|e| panic!("invalid location regex: {e}"))
    });

    if let Some(caps) = re.captures(text) {
        let place = caps[1]
            .trim()
            .trim_end_matches(['.', ',', '!', '?'])
            .trim()
            .to_string();
        if !place.is_empty() {
            return Some(place);
        }
    }

    let location = profile.location();
    if location.is_empty() {
        None
    } else {
        Some(location)
    }
}

fn format_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| match &p.source {
            Some(source) => format!("[{source}] {}", p.text),
            None => p.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_search_reply(topic: &str, location: &str, snippets: &[SearchSnippet]) -> String {
    if snippets.is_empty() {
        return format!(
            "I couldn't find current reports about {topic} in {location}. Local health \
             department channels are the most reliable source for alerts."
        );
    }
    let mut reply = format!("Here is the latest I found on {topic} in {location}:\n");
    for (i, snippet) in snippets.iter().enumerate() {
        reply.push_str(&format!("\n{}. {} — {}", i + 1, snippet.title, snippet.snippet));
        if !snippet.link.is_empty() {
            reply.push_str(&format!(" ({})", snippet.link));
        }
    }
    reply.push_str("\n\nFollow your local health department's guidance for prevention.");
    reply
}
