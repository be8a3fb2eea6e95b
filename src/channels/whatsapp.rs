//! Twilio WhatsApp channel — webhook parsing and outbound sends.
//!
//! Inbound messages arrive as form-encoded webhook posts; outbound sends go
//! through the Messages API with basic auth. Long replies are split at
//! WhatsApp's message size limit.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;

use crate::channels::MessagingChannel;
use crate::config::TwilioConfig;
use crate::error::ChannelError;
use crate::pipeline::types::{InboundEvent, MediaRef};

/// Maximum body length for a single WhatsApp message via Twilio.
const WHATSAPP_MAX_MESSAGE_LENGTH: usize = 1600;

/// Media content types the bot accepts from users.
const ALLOWED_MEDIA_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

/// Maximum accepted media size in bytes (10 MB).
pub const MAX_MEDIA_BYTES: u64 = 10 * 1024 * 1024;

/// Twilio WhatsApp channel.
pub struct TwilioWhatsApp {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioWhatsApp {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        )
    }

    /// Parse a webhook form body into an `InboundEvent`.
    ///
    /// Media entries with unsupported content types are dropped (the reply
    /// pipeline would have nothing to do with them).
    pub fn parse_webhook(form: &HashMap<String, String>) -> Result<InboundEvent, ChannelError> {
        let id = form
            .get("MessageSid")
            .or_else(|| form.get("SmsMessageSid"))
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| ChannelError::InvalidPayload("missing MessageSid".into()))?
            .clone();

        let from = form
            .get("From")
            .filter(|from| !from.is_empty())
            .ok_or_else(|| ChannelError::InvalidPayload("missing From".into()))?;
        let sender = normalize_phone(from);

        let body = form.get("Body").cloned().unwrap_or_default();

        let num_media: usize = form
            .get("NumMedia")
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        let mut media = Vec::new();
        for i in 0..num_media {
            let url = form.get(&format!("MediaUrl{i}"));
            let content_type = form.get(&format!("MediaContentType{i}"));
            if let (Some(url), Some(content_type)) = (url, content_type) {
                if !allowed_media_type(content_type) {
                    tracing::warn!(content_type, "Dropping unsupported media attachment");
                    continue;
                }
                media.push(MediaRef {
                    url: url.clone(),
                    content_type: content_type.to_lowercase(),
                });
            }
        }

        Ok(InboundEvent {
            id,
            sender,
            body,
            media,
            received_at: Utc::now(),
        })
    }

    /// Send a single message chunk. Returns the provider sid.
    async fn send_chunk(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<String, ChannelError> {
        let to_addr = channel_address(to);
        let mut form = vec![
            ("To", to_addr.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", body),
        ];
        if let Some(url) = media_url {
            form.push(("MediaUrl", url));
        }

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "whatsapp".into(),
                reason: format!("Messages API returned {status}: {err_body}"),
            });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| ChannelError::SendFailed {
            name: "whatsapp".into(),
            reason: format!("invalid Messages API response: {e}"),
        })?;

        Ok(data
            .get("sid")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl MessagingChannel for TwilioWhatsApp {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<String, ChannelError> {
        let chunks = split_message(body, WHATSAPP_MAX_MESSAGE_LENGTH);
        let last = chunks.len().saturating_sub(1);
        let mut delivery_id = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            // Media rides on the final chunk so it lands after the text.
            let media = if i == last { media_url } else { None };
            delivery_id = self.send_chunk(to, chunk, media).await?;
        }
        tracing::info!(to, chunks = chunks.len(), "WhatsApp message sent");
        Ok(delivery_id)
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}.json",
            self.config.account_sid
        );
        let resp = self
            .client
            .get(&url)
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| ChannelError::HealthCheckFailed {
                name: "whatsapp".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::HealthCheckFailed {
                name: "whatsapp".into(),
                reason: format!("account endpoint returned {}", resp.status()),
            })
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Strip the provider prefix: `whatsapp:+91...` → `+91...`.
pub fn normalize_phone(raw: &str) -> String {
    raw.strip_prefix("whatsapp:").unwrap_or(raw).to_string()
}

/// The provider address form for a normalized phone number.
pub fn channel_address(phone: &str) -> String {
    if phone.starts_with("whatsapp:") {
        phone.to_string()
    } else {
        format!("whatsapp:{phone}")
    }
}

/// Whether a media content type is accepted.
pub fn allowed_media_type(content_type: &str) -> bool {
    let lowered = content_type.to_lowercase();
    ALLOWED_MEDIA_TYPES.iter().any(|t| *t == lowered)
}

/// Split a message into chunks that fit the channel's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let chunk = &remaining[..max_len];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(max_len);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { max_len } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn channel() -> TwilioWhatsApp {
        TwilioWhatsApp::new(TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: SecretString::from("fake-token"),
            from_number: "whatsapp:+14155238886".into(),
        })
    }

    fn webhook_form(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ── Basic channel tests ─────────────────────────────────────────

    #[test]
    fn channel_name() {
        assert_eq!(channel().name(), "whatsapp");
    }

    #[test]
    fn messages_url_includes_account() {
        assert_eq!(
            channel().messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    // ── Phone normalization ─────────────────────────────────────────

    #[test]
    fn normalize_strips_prefix() {
        assert_eq!(normalize_phone("whatsapp:+919876543210"), "+919876543210");
        assert_eq!(normalize_phone("+919876543210"), "+919876543210");
    }

    #[test]
    fn channel_address_adds_prefix_once() {
        assert_eq!(channel_address("+919876543210"), "whatsapp:+919876543210");
        assert_eq!(
            channel_address("whatsapp:+919876543210"),
            "whatsapp:+919876543210"
        );
    }

    // ── Webhook parsing ─────────────────────────────────────────────

    #[test]
    fn parse_text_webhook() {
        let form = webhook_form(&[
            ("MessageSid", "SM-abc"),
            ("From", "whatsapp:+919876543210"),
            ("Body", "I have a fever"),
            ("NumMedia", "0"),
        ]);
        let event = TwilioWhatsApp::parse_webhook(&form).unwrap();
        assert_eq!(event.id, "SM-abc");
        assert_eq!(event.sender, "+919876543210");
        assert_eq!(event.body, "I have a fever");
        assert!(event.media.is_empty());
    }

    #[test]
    fn parse_webhook_with_image() {
        let form = webhook_form(&[
            ("MessageSid", "SM-img"),
            ("From", "whatsapp:+919876543210"),
            ("Body", "what is this rash?"),
            ("NumMedia", "1"),
            ("MediaUrl0", "https://api.twilio.com/media/1"),
            ("MediaContentType0", "image/jpeg"),
        ]);
        let event = TwilioWhatsApp::parse_webhook(&form).unwrap();
        assert_eq!(event.media.len(), 1);
        assert_eq!(event.media[0].content_type, "image/jpeg");
        assert!(event.media[0].is_image());
    }

    #[test]
    fn parse_webhook_drops_unsupported_media() {
        let form = webhook_form(&[
            ("MessageSid", "SM-vid"),
            ("From", "whatsapp:+919876543210"),
            ("Body", ""),
            ("NumMedia", "2"),
            ("MediaUrl0", "https://api.twilio.com/media/1"),
            ("MediaContentType0", "video/mp4"),
            ("MediaUrl1", "https://api.twilio.com/media/2"),
            ("MediaContentType1", "application/pdf"),
        ]);
        let event = TwilioWhatsApp::parse_webhook(&form).unwrap();
        assert_eq!(event.media.len(), 1);
        assert!(event.media[0].is_document());
    }

    #[test]
    fn parse_webhook_missing_sid_fails() {
        let form = webhook_form(&[("From", "whatsapp:+919876543210"), ("Body", "hi")]);
        assert!(TwilioWhatsApp::parse_webhook(&form).is_err());
    }

    #[test]
    fn parse_webhook_missing_from_fails() {
        let form = webhook_form(&[("MessageSid", "SM-x"), ("Body", "hi")]);
        assert!(TwilioWhatsApp::parse_webhook(&form).is_err());
    }

    #[test]
    fn parse_webhook_accepts_sms_message_sid() {
        let form = webhook_form(&[
            ("SmsMessageSid", "SM-legacy"),
            ("From", "whatsapp:+919876543210"),
        ]);
        let event = TwilioWhatsApp::parse_webhook(&form).unwrap();
        assert_eq!(event.id, "SM-legacy");
        assert_eq!(event.body, "");
    }

    // ── Media validation ────────────────────────────────────────────

    #[test]
    fn allowed_media_types_cover_images_and_documents() {
        assert!(allowed_media_type("image/jpeg"));
        assert!(allowed_media_type("IMAGE/PNG"));
        assert!(allowed_media_type("application/pdf"));
        assert!(!allowed_media_type("video/mp4"));
        assert!(!allowed_media_type("audio/ogg"));
    }

    // ── Message splitting ───────────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 1600);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(1600);
        let chunks = split_message(&msg, 1600);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1600);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(800), "b".repeat(1200));
        let chunks = split_message(&msg, 1600);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(800));
        assert_eq!(chunks[1], "b".repeat(1200));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(2000);
        let chunks = split_message(&msg, 1600);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1600);
        assert_eq!(chunks[1].len(), 400);
    }

    // ── Network error tests (expected to fail with no server) ───────

    #[tokio::test]
    async fn send_fails_against_fake_credentials() {
        let result = channel().send("+919876543210", "test", None).await;
        assert!(result.is_err());
    }
}
