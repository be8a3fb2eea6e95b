//! Vision and document analysis over an OpenAI-style multimodal API.

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::config::VisionConfig;
use crate::error::CapabilityError;
use crate::pipeline::types::MediaRef;
use crate::services::{DocumentFindings, MediaKind, VisionService};

/// Multimodal chat-completions client.
pub struct HttpVisionService {
    config: VisionConfig,
    client: reqwest::Client,
}

impl HttpVisionService {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// One image + instruction round trip; returns the raw model text.
    async fn ask_about_image(
        &self,
        system: &str,
        instruction: &str,
        image_url: &str,
        max_tokens: u32,
    ) -> Result<String, CapabilityError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "messages": [
                { "role": "system", "content": system },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": instruction },
                        { "type": "image_url", "image_url": { "url": image_url } }
                    ]
                }
            ]
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::failed(format!(
                "vision endpoint returned {}",
                resp.status()
            )));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Self::failed(format!("invalid vision response: {e}")))?;

        data.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Self::failed("vision response missing content".to_string()))
    }

    fn failed(reason: String) -> CapabilityError {
        CapabilityError::Failed {
            name: "vision".into(),
            reason,
        }
    }
}

#[async_trait]
impl VisionService for HttpVisionService {
    async fn classify(&self, media: &MediaRef) -> Result<MediaKind, CapabilityError> {
        let raw = self
            .ask_about_image(
                "You classify medical images. Answer with exactly one word.",
                "Is this image a 'skin' photo (skin, rash, wound, lesion), a 'report' \
                 (medical report, prescription, lab result, scanned document), or 'other'? \
                 Answer with one word: skin, report, or other.",
                &media.url,
                8,
            )
            .await?;
        Ok(parse_media_kind(&raw))
    }

    async fn analyze_skin(
        &self,
        media: &MediaRef,
        profile_summary: &str,
    ) -> Result<String, CapabilityError> {
        self.ask_about_image(
            "You are a dermatology assistant. Describe what is visible, list possible \
             conditions with clear uncertainty, suggest immediate care, and say when to \
             see a doctor. Never present a diagnosis as certain.",
            &format!(
                "Patient context: {profile_summary}\n\n\
                 Analyze this skin photo. Structure the answer as:\n\
                 What I can see / Possible conditions / Immediate care / When to see a doctor."
            ),
            &media.url,
            1024,
        )
        .await
    }

    async fn extract_document(
        &self,
        media: &MediaRef,
    ) -> Result<DocumentFindings, CapabilityError> {
        let raw = self
            .ask_about_image(
                "You extract structured data from medical documents. Output only valid JSON.",
                "Read this medical document and respond with ONLY a JSON object:\n\
                 {\"summary\": \"...\", \"conditions\": [\"...\"], \"medications\": [\"...\"]}\n\
                 summary: 2-3 sentences of the key findings.\n\
                 conditions: diagnosed or suspected conditions mentioned.\n\
                 medications: medications named in the document.",
                &media.url,
                1024,
            )
            .await?;
        parse_findings(&raw).ok_or_else(|| Self::failed(format!("unparseable findings: {raw}")))
    }
}

fn parse_media_kind(raw: &str) -> MediaKind {
    let lowered = raw.to_lowercase();
    if lowered.contains("skin") {
        MediaKind::SkinPhoto
    } else if lowered.contains("report") || lowered.contains("document") {
        MediaKind::DocumentReport
    } else {
        MediaKind::Other
    }
}

fn parse_findings(raw: &str) -> Option<DocumentFindings> {
    let json_str = extract_json_object(raw);
    let value: serde_json::Value = serde_json::from_str(&json_str).ok()?;
    let summary = value.get("summary")?.as_str()?.to_string();
    let list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(|s| s.to_lowercase()))
                    .collect()
            })
            .unwrap_or_default()
    };
    Some(DocumentFindings {
        summary,
        conditions: list("conditions"),
        medications: list("medications"),
    })
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_parsing() {
        assert_eq!(parse_media_kind("skin"), MediaKind::SkinPhoto);
        assert_eq!(parse_media_kind("Skin photo"), MediaKind::SkinPhoto);
        assert_eq!(parse_media_kind("report"), MediaKind::DocumentReport);
        assert_eq!(parse_media_kind("a scanned document"), MediaKind::DocumentReport);
        assert_eq!(parse_media_kind("other"), MediaKind::Other);
        assert_eq!(parse_media_kind("no idea"), MediaKind::Other);
    }

    #[test]
    fn findings_parse_plain_json() {
        let raw = r#"{"summary": "CBC report, mild anemia.", "conditions": ["Anemia"], "medications": ["Ferrous Sulfate"]}"#;
        let findings = parse_findings(raw).unwrap();
        assert!(findings.summary.contains("CBC"));
        assert_eq!(findings.conditions, vec!["anemia"]);
        assert_eq!(findings.medications, vec!["ferrous sulfate"]);
    }

    #[test]
    fn findings_parse_markdown_wrapped() {
        let raw = "Here you go:\n```json\n{\"summary\": \"X-ray, no fracture.\", \"conditions\": [], \"medications\": []}\n```";
        let findings = parse_findings(raw).unwrap();
        assert!(findings.summary.contains("X-ray"));
        assert!(findings.conditions.is_empty());
    }

    #[test]
    fn findings_missing_summary_fails() {
        assert!(parse_findings(r#"{"conditions": []}"#).is_none());
        assert!(parse_findings("not json at all").is_none());
    }

    #[test]
    fn extract_json_embedded_in_text() {
        let input = "Analysis: {\"summary\": \"ok\"} done.";
        let result = extract_json_object(input);
        assert!(result.starts_with('{'));
        assert!(result.ends_with('}'));
    }
}
