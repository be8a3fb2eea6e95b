//! LLM-backed language detection and translation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::services::{llm_failure, LanguageService};

/// Languages the bot can detect and reply in.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("hi", "Hindi"),
    ("ta", "Tamil"),
    ("te", "Telugu"),
    ("bn", "Bengali"),
    ("gu", "Gujarati"),
    ("kn", "Kannada"),
    ("ml", "Malayalam"),
    ("mr", "Marathi"),
    ("pa", "Punjabi"),
    ("or", "Odia"),
    ("as", "Assamese"),
    ("ur", "Urdu"),
];

/// Resolve a user-supplied language answer (code or name) to a code.
pub fn resolve_language(input: &str) -> Option<String> {
    let wanted = input.trim().to_lowercase();
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(code, name)| *code == wanted || name.to_lowercase() == wanted)
        .map(|(code, _)| (*code).to_string())
}

/// Human-readable option list, e.g. "English (en), Hindi (hi), ...".
pub fn supported_language_list() -> String {
    SUPPORTED_LANGUAGES
        .iter()
        .map(|(code, name)| format!("{name} ({code})"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn language_name(code: &str) -> &'static str {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or("English")
}

/// Language service backed by the shared LLM provider.
pub struct LlmLanguageService {
    llm: Arc<dyn LlmProvider>,
}

impl LlmLanguageService {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl LanguageService for LlmLanguageService {
    async fn detect(&self, text: &str) -> Result<String, CapabilityError> {
        let codes = SUPPORTED_LANGUAGES
            .iter()
            .map(|(code, name)| format!("{code}: {name}"))
            .collect::<Vec<_>>()
            .join(", ");
        let request = CompletionRequest::new(
            "You are a language identification engine. Output only a 2-letter language code.",
            format!(
                "Detect the language of the following text and return only the language code \
                 from this list: {codes}\n\
                 If the language is not in the list, return 'en'.\n\n\
                 Text: \"{text}\""
            ),
        )
        .with_max_tokens(8)
        .with_temperature(0.0);

        let raw = self
            .llm
            .complete(request)
            .await
            .map_err(|e| llm_failure("language.detect", e))?;
        Ok(parse_detected_code(&raw))
    }

    async fn translate(
        &self,
        text: &str,
        from: &str,
        to: &str,
    ) -> Result<String, CapabilityError> {
        if from == to {
            return Ok(text.to_string());
        }
        let request = CompletionRequest::new(
            "You are a medical translator. Preserve medical terms and intent exactly. \
             Use simple, clear wording. Output only the translation.",
            format!(
                "Translate the following {} text to {}:\n\n{}",
                language_name(from),
                language_name(to),
                text
            ),
        )
        .with_max_tokens(2048)
        .with_temperature(0.2);

        let translated = self
            .llm
            .complete(request)
            .await
            .map_err(|e| llm_failure("language.translate", e))?;
        Ok(translated.trim().to_string())
    }
}

/// Normalize the model's detection output to a supported code, defaulting
/// to English for anything unrecognized.
fn parse_detected_code(raw: &str) -> String {
    let code = raw.trim().trim_matches('"').to_lowercase();
    if SUPPORTED_LANGUAGES.iter().any(|(c, _)| *c == code) {
        code
    } else {
        tracing::warn!(detected = %code, "Unknown language detected, defaulting to English");
        "en".to_string()
    }
}
