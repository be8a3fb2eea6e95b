//! End-to-end pipeline tests over the HTTP surface.
//!
//! Spins the real axum server on a random port with an in-memory database
//! and mock collaborators, then drives it the way the messaging provider
//! would: form-encoded webhook posts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use arogya_bot::channels::MessagingChannel;
use arogya_bot::config::{PipelineConfig, SafetyConfig};
use arogya_bot::delivery::{DeliveryCoordinator, DeliveryDeps};
use arogya_bot::error::{CapabilityError, ChannelError};
use arogya_bot::pipeline::router::{CapabilitySet, QueryRouter};
use arogya_bot::pipeline::types::MediaRef;
use arogya_bot::profile::{ProfileGate, UserProfile};
use arogya_bot::safety::SafetyValidator;
use arogya_bot::server::{routes, AppState};
use arogya_bot::services::{
    DocumentFindings, LanguageService, MediaKind, Passage, RetrievalService, SearchService,
    SearchSnippet, SynthesisService, VisionService,
};
use arogya_bot::store::{ChatTurn, LibSqlBackend, ProfileStore, SessionStore};

// ── Mock collaborators ──────────────────────────────────────────────

struct EnglishOnly;

#[async_trait]
impl LanguageService for EnglishOnly {
    async fn detect(&self, _text: &str) -> Result<String, CapabilityError> {
        Ok("en".into())
    }

    async fn translate(
        &self,
        text: &str,
        _from: &str,
        _to: &str,
    ) -> Result<String, CapabilityError> {
        Ok(text.to_string())
    }
}

#[derive(Default)]
struct OutboxChannel {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessagingChannel for OutboxChannel {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn send(
        &self,
        to: &str,
        body: &str,
        _media_url: Option<&str>,
    ) -> Result<String, ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(format!("OUT-{}", self.sent.lock().unwrap().len()))
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[derive(Default)]
struct FlakyRetrieval {
    fail_remaining: AtomicUsize,
    erased: Mutex<Vec<String>>,
}

#[async_trait]
impl RetrievalService for FlakyRetrieval {
    async fn query(
        &self,
        _text: &str,
        _namespace: &str,
        _top_k: usize,
    ) -> Result<Vec<Passage>, CapabilityError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CapabilityError::Failed {
                name: "retrieval".into(),
                reason: "index unavailable".into(),
            });
        }
        Ok(vec![Passage {
            text: "Drink fluids and rest for viral fever.".into(),
            score: 0.8,
            source: Some("reference".into()),
        }])
    }

    async fn index(&self, _ns: &str, _id: &str, _text: &str) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn erase_namespace(&self, namespace: &str) -> Result<(), CapabilityError> {
        self.erased.lock().unwrap().push(namespace.to_string());
        Ok(())
    }
}

struct NoSearch;

#[async_trait]
impl SearchService for NoSearch {
    async fn search(
        &self,
        _query: &str,
        _location: Option<&str>,
    ) -> Result<Vec<SearchSnippet>, CapabilityError> {
        Ok(vec![])
    }
}

struct NoVision;

#[async_trait]
impl VisionService for NoVision {
    async fn classify(&self, _media: &MediaRef) -> Result<MediaKind, CapabilityError> {
        Ok(MediaKind::Other)
    }

    async fn analyze_skin(
        &self,
        _media: &MediaRef,
        _profile: &str,
    ) -> Result<String, CapabilityError> {
        Ok("analysis".into())
    }

    async fn extract_document(
        &self,
        _media: &MediaRef,
    ) -> Result<DocumentFindings, CapabilityError> {
        Ok(DocumentFindings::default())
    }
}

struct EchoSynthesis;

#[async_trait]
impl SynthesisService for EchoSynthesis {
    async fn respond(
        &self,
        question: &str,
        context: &str,
        _profile: &UserProfile,
        _history: &[ChatTurn],
    ) -> Result<String, CapabilityError> {
        if context.is_empty() {
            Ok(format!("Answer to '{question}'."))
        } else {
            Ok(format!("Answer to '{question}' using context."))
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    base_url: String,
    outbox: Arc<OutboxChannel>,
    retrieval: Arc<FlakyRetrieval>,
    db: Arc<LibSqlBackend>,
    client: reqwest::Client,
}

async fn start_server() -> Harness {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let outbox = Arc::new(OutboxChannel::default());
    let retrieval = Arc::new(FlakyRetrieval::default());

    let pipeline_config = PipelineConfig {
        call_timeout: Duration::from_secs(2),
        ..Default::default()
    };

    let router = QueryRouter::new(
        CapabilitySet {
            retrieval: retrieval.clone(),
            search: Arc::new(NoSearch),
            vision: Arc::new(NoVision),
            synthesis: Arc::new(EchoSynthesis),
        },
        pipeline_config.clone(),
        "health-reference".into(),
    );

    let coordinator = DeliveryCoordinator::new(DeliveryDeps {
        profiles: db.clone(),
        sessions: db.clone(),
        events: db.clone(),
        language: Arc::new(EnglishOnly),
        channel: outbox.clone(),
        router,
        gate: ProfileGate::new(120),
        safety: SafetyValidator::new(SafetyConfig::default()),
        config: pipeline_config,
    });

    let state = Arc::new(AppState {
        coordinator,
        profiles: db.clone(),
        sessions: db.clone(),
        retrieval: retrieval.clone(),
        channel: outbox.clone(),
        started_at: chrono::Utc::now(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes(state)).await.ok();
    });

    Harness {
        base_url: format!("http://{addr}"),
        outbox,
        retrieval,
        db,
        client: reqwest::Client::new(),
    }
}

impl Harness {
    async fn post_message(&self, sid: &str, from: &str, body: &str) -> reqwest::StatusCode {
        let mut form = HashMap::new();
        form.insert("MessageSid", sid.to_string());
        form.insert("From", format!("whatsapp:{from}"));
        form.insert("Body", body.to_string());
        form.insert("NumMedia", "0".to_string());

        let resp = self
            .client
            .post(format!("{}/webhook/whatsapp", self.base_url))
            .form(&form)
            .send()
            .await
            .unwrap();
        resp.status()
    }

    /// Wait until the outbox holds at least `n` messages.
    async fn wait_for_sends(&self, n: usize) {
        for _ in 0..300 {
            if self.outbox.sent.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {n} sends, have {}",
            self.outbox.sent.lock().unwrap().len()
        );
    }

    fn last_reply(&self) -> String {
        self.outbox.sent.lock().unwrap().last().unwrap().1.clone()
    }

    async fn onboard(&self, from: &str) {
        let answers = [
            "hello", "Asha", "34", "female", "Pune, Maharashtra", "en", "9876543210",
            "penicillin", "none", "none",
        ];
        let start = self.outbox.sent.lock().unwrap().len();
        for (i, answer) in answers.iter().enumerate() {
            self.post_message(&format!("SM-onb-{from}-{i}"), from, answer)
                .await;
            self.wait_for_sends(start + i + 1).await;
        }
        assert!(
            self.last_reply().contains("profile is now complete"),
            "onboarding did not complete: {}",
            self.last_reply()
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_acks_and_onboards_new_user() {
    let harness = start_server().await;
    let status = harness
        .post_message("SM-1", "+911111111111", "hello")
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);

    harness.wait_for_sends(1).await;
    let reply = harness.last_reply();
    assert!(reply.contains("Welcome"));
    assert!(reply.contains("full name"));

    let profile = harness.db.get("+911111111111").await.unwrap().unwrap();
    assert!(profile.name.is_empty());
}

#[tokio::test]
async fn full_onboarding_then_query_with_disclaimer() {
    let harness = start_server().await;
    harness.onboard("+911111111111").await;

    harness
        .post_message("SM-q", "+911111111111", "I have a mild fever")
        .await;
    harness.wait_for_sends(11).await;

    let reply = harness.last_reply();
    assert!(reply.contains("Answer to 'I have a mild fever' using context."));
    assert!(reply.contains("AI guidance only"));

    let turns = harness.db.recent("+911111111111", 1).await.unwrap();
    assert_eq!(turns[0].handlers, vec!["retrieval", "conversation"]);
}

#[tokio::test]
async fn redelivered_webhook_sends_exactly_one_reply() {
    let harness = start_server().await;
    harness.post_message("SM-dup", "+911111111111", "hi").await;
    harness.post_message("SM-dup", "+911111111111", "hi").await;
    harness.post_message("SM-dup", "+911111111111", "hi").await;
    harness.wait_for_sends(1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.outbox.sent.lock().unwrap().len(), 1);
    assert_eq!(SessionStore::count(harness.db.as_ref()).await.unwrap(), 1);
}

#[tokio::test]
async fn emergency_message_gets_escalation_template() {
    let harness = start_server().await;
    harness.onboard("+911111111111").await;

    harness
        .post_message("SM-e", "+911111111111", "emergency, can't breathe")
        .await;
    harness.wait_for_sends(11).await;

    let reply = harness.last_reply();
    assert!(reply.contains("EMERGENCY DETECTED"));
    assert!(!reply.contains("Answer to"));
}

#[tokio::test]
async fn retrieval_outage_degrades_but_still_delivers() {
    let harness = start_server().await;
    harness.onboard("+911111111111").await;

    // Fail the next several retrieval calls: the single retry also fails,
    // but the conversation capability still answers.
    harness.retrieval.fail_remaining.store(8, Ordering::SeqCst);
    harness
        .post_message("SM-deg", "+911111111111", "I have a mild fever")
        .await;
    harness.wait_for_sends(11).await;

    let reply = harness.last_reply();
    assert!(reply.contains("Answer to 'I have a mild fever'."));
    assert!(reply.contains("some reference material was unavailable"));
}

#[tokio::test]
async fn admin_profile_is_redacted_and_deletable() {
    let harness = start_server().await;
    harness.onboard("+911111111111").await;

    // The onboarding set medical history to "none" (empty); write one so
    // redaction is observable.
    let mut profile = harness.db.get("+911111111111").await.unwrap().unwrap();
    profile.medical_history = "diabetes since 2019".into();
    harness.db.upsert(&profile).await.unwrap();

    let user: serde_json::Value = harness
        .client
        .get(format!("{}/api/user/+911111111111", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(user["name"], "Asha");
    assert_eq!(user["medical_history"], "[redacted]");

    let deleted: serde_json::Value = harness
        .client
        .delete(format!("{}/api/user/+911111111111", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["deleted"], true);

    // Erasure reaches every store: profile, chat turns, vector namespace.
    assert!(harness.db.get("+911111111111").await.unwrap().is_none());
    assert_eq!(SessionStore::count(harness.db.as_ref()).await.unwrap(), 0);
    assert_eq!(
        harness.retrieval.erased.lock().unwrap().as_slice(),
        ["user-911111111111"]
    );

    let missing = harness
        .client
        .get(format!("{}/api/user/+911111111111", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_reflect_store_contents() {
    let harness = start_server().await;
    harness.onboard("+911111111111").await;
    harness.post_message("SM-new", "+912222222222", "hi").await;
    harness.wait_for_sends(11).await;

    let stats: serde_json::Value = harness
        .client
        .get(format!("{}/api/stats", harness.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["users"], 2);
    assert_eq!(stats["onboarding_completed"], 1);
    assert_eq!(stats["chat_turns"], 11);
}

#[tokio::test]
async fn malformed_webhook_still_acknowledged() {
    let harness = start_server().await;
    let mut form = HashMap::new();
    form.insert("Body", "no sid here".to_string());

    let resp = harness
        .client
        .post(format!("{}/webhook/whatsapp", harness.base_url))
        .form(&form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.text().await.unwrap().contains("<Response></Response>"));
}
