//! Delivery coordinator — exactly-once processing per inbound event.
//!
//! Responsibilities:
//! - claim each provider message id exactly once (redeliveries are
//!   acknowledged but never reprocessed)
//! - run the gate → router → safety pipeline in a background task
//! - serialize events per phone number, in arrival order, via
//!   single-task-per-key queues; distinct phones run concurrently
//! - send the final reply, record the chat turn, and drive the persisted
//!   event state to `Delivered` or `Failed`

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{error, info, warn};

use crate::channels::MessagingChannel;
use crate::config::PipelineConfig;
use crate::error::{ChannelError, Error};
use crate::pipeline::router::QueryRouter;
use crate::pipeline::types::{DraftReply, InboundEvent};
use crate::profile::{GateDecision, GateOutcome, ProfileGate, UserProfile};
use crate::safety::{SafetyValidator, SafetyVerdict};
use crate::services::LanguageService;
use crate::store::{ChatTurn, EventState, EventStore, ProfileStore, SessionStore};

/// What `accept` did with a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// First delivery — queued for background processing.
    Enqueued,
    /// Redelivery of a known event id — acknowledged, nothing queued.
    Duplicate,
}

/// Everything the pipeline needs, behind trait objects.
pub struct DeliveryDeps {
    pub profiles: Arc<dyn ProfileStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventStore>,
    pub language: Arc<dyn LanguageService>,
    pub channel: Arc<dyn MessagingChannel>,
    pub router: QueryRouter,
    pub gate: ProfileGate,
    pub safety: SafetyValidator,
    pub config: PipelineConfig,
}

/// Coordinates acknowledgment, background processing, and delivery.
pub struct DeliveryCoordinator {
    deps: DeliveryDeps,
    /// One ordered queue per phone number.
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<InboundEvent>>>,
    /// Events accepted but not yet terminal.
    inflight: AtomicUsize,
    idle: Notify,
    /// Handle to ourselves for the per-user worker tasks.
    self_ref: Weak<DeliveryCoordinator>,
}

impl DeliveryCoordinator {
    pub fn new(deps: DeliveryDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            deps,
            queues: Mutex::new(HashMap::new()),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
            self_ref: weak.clone(),
        })
    }

    /// Accept one webhook delivery. Fast: one idempotency write plus a
    /// queue push, so the webhook can be acknowledged immediately.
    pub async fn accept(&self, event: InboundEvent) -> Result<AcceptOutcome, Error> {
        if !self.deps.events.claim(&event).await? {
            info!(event_id = %event.id, "Duplicate delivery acknowledged without processing");
            return Ok(AcceptOutcome::Duplicate);
        }
        self.enqueue(event).await;
        Ok(AcceptOutcome::Enqueued)
    }

    /// Push an already-claimed event onto its phone's ordered queue.
    async fn enqueue(&self, event: InboundEvent) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.queues.lock().await;
        let sender = queues.entry(event.sender.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            self.spawn_worker(event.sender.clone(), rx);
            tx
        });
        if sender.send(event).is_err() {
            // Worker died; should not happen while the map entry exists.
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            error!("Per-user queue closed unexpectedly");
        }
    }

    /// One worker per phone number drains its queue in arrival order.
    fn spawn_worker(&self, phone: String, mut rx: mpsc::UnboundedReceiver<InboundEvent>) {
        let Some(coordinator) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                coordinator.process(event).await;
                if coordinator.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    coordinator.idle.notify_waiters();
                }
            }
            tracing::debug!(phone, "Per-user worker stopped");
        });
    }

    /// Re-queue events left `Processing` by a previous run. Each gets one
    /// reprocessing attempt; anything already reattempted is marked failed.
    pub async fn recover_incomplete(&self) -> Result<usize, Error> {
        let incomplete = self.deps.events.incomplete().await?;
        let mut recovered = 0;
        for stored in incomplete {
            if stored.attempts >= 2 {
                self.deps
                    .events
                    .mark(
                        &stored.event.id,
                        EventState::Failed,
                        Some("unresumed after restart"),
                    )
                    .await?;
                warn!(event_id = %stored.event.id, "Gave up on repeatedly interrupted event");
                continue;
            }
            self.deps.events.record_attempt(&stored.event.id).await?;
            self.enqueue(stored.event).await;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "Recovered interrupted events from previous run");
        }
        Ok(recovered)
    }

    /// Let in-flight events reach a terminal state before returning.
    pub async fn shutdown(&self, grace: Duration) {
        // Close all queues so workers stop after draining.
        self.queues.lock().await.clear();
        let deadline = tokio::time::Instant::now() + grace;
        while self.inflight.load(Ordering::SeqCst) > 0 {
            let wait = self.idle.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                let remaining = self.inflight.load(Ordering::SeqCst);
                if remaining > 0 {
                    warn!(
                        remaining,
                        "Shutdown grace period expired with events still in flight"
                    );
                }
                return;
            }
        }
    }

    // ── Pipeline ────────────────────────────────────────────────────

    /// Process one claimed event to a terminal state. Never panics; any
    /// pipeline-fatal error marks the event `Failed`.
    async fn process(&self, event: InboundEvent) {
        match self.run_pipeline(&event).await {
            Ok(()) => {}
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Pipeline failed");
                if let Err(mark_err) = self
                    .deps
                    .events
                    .mark(&event.id, EventState::Failed, Some(&e.to_string()))
                    .await
                {
                    error!(event_id = %event.id, error = %mark_err, "Could not record failure");
                }
            }
        }
    }

    async fn run_pipeline(&self, event: &InboundEvent) -> Result<(), Error> {
        // A profile read failure aborts: never guess at profile state.
        let profile = self.deps.profiles.get(&event.sender).await?;

        let mut profile = match profile {
            Some(profile) => profile,
            None => {
                // First contact: create the empty profile and greet. The
                // first message is not consumed as an answer.
                let profile = UserProfile::new(event.sender.clone());
                self.deps.profiles.upsert(&profile).await?;
                let welcome = self.deps.gate.welcome(&profile);
                return self
                    .deliver(event, &welcome, "en", &["onboarding".into()])
                    .await;
            }
        };

        match self.deps.gate.check(&profile) {
            GateDecision::IncompleteAt(_) => {
                let outcome =
                    self.deps
                        .gate
                        .advance(&mut profile, &event.body, event.has_media());
                if outcome.mutated() {
                    self.deps.profiles.upsert(&profile).await?;
                }
                let flag = match outcome {
                    GateOutcome::Completed { .. } => "onboarding_completed",
                    _ => "onboarding",
                };
                self.deliver(event, outcome.reply(), "en", &[flag.into()])
                    .await
            }
            GateDecision::Complete => self.run_query(event, &profile).await,
        }
    }

    /// The gated query path: translate → route → safety → reply.
    async fn run_query(&self, event: &InboundEvent, profile: &UserProfile) -> Result<(), Error> {
        let working_language = self.deps.config.working_language.clone();

        // Detect the message language; on failure fall back to the user's
        // stored preference rather than dropping the event.
        let language = if event.body.trim().is_empty() {
            fallback_language(profile)
        } else {
            match self.bounded(self.deps.language.detect(&event.body)).await {
                Ok(code) => code,
                Err(e) => {
                    warn!(error = %e, "Language detection failed, using profile preference");
                    fallback_language(profile)
                }
            }
        };

        // Translate into the working language for the handlers.
        let working_body = if language != working_language && !event.body.trim().is_empty() {
            match self
                .bounded(
                    self.deps
                        .language
                        .translate(&event.body, &language, &working_language),
                )
                .await
            {
                Ok(translated) => translated,
                Err(e) => {
                    warn!(error = %e, "Inbound translation failed, using original text");
                    event.body.clone()
                }
            }
        } else {
            event.body.clone()
        };

        let working_event = InboundEvent {
            body: working_body.clone(),
            ..event.clone()
        };

        let history = match self
            .deps
            .sessions
            .recent(&profile.phone, self.deps.config.history_turns)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "History read failed, continuing without context");
                Vec::new()
            }
        };

        let plan = self.deps.router.plan(&working_event, profile).await;
        let draft = self
            .deps
            .router
            .execute(&plan, &working_event, profile, &history)
            .await;

        // The emergency scan sees the original text and the working-language
        // text, so both keyword tables get a chance to match.
        let scan_text = if working_body != event.body {
            format!("{}\n{}", event.body, working_body)
        } else {
            event.body.clone()
        };
        let verdict = self
            .deps
            .safety
            .validate(&scan_text, &draft.text, profile, &language);

        if verdict.blocked {
            info!(event_id = %event.id, "Emergency detected, substituting escalation reply");
            let reply = self.deps.safety.emergency_reply();
            let outbound = self.localize(&reply, &language).await;
            return self
                .deliver(event, &outbound, &language, &["emergency".into()])
                .await;
        }

        // Handler warnings precede the validator's own warnings.
        let SafetyVerdict {
            emergency_detected,
            warnings: validator_warnings,
            blocked,
        } = verdict;
        let verdict = SafetyVerdict {
            emergency_detected,
            warnings: merge_warnings(&draft, validator_warnings),
            blocked,
        };
        let final_reply = self.deps.safety.finalize(&draft.text, &verdict);
        let outbound = self.localize(&final_reply, &language).await;

        let handlers: Vec<String> = draft.handlers.iter().map(|c| c.name().to_string()).collect();
        let mut flags = verdict.warnings.clone();
        if draft.degraded {
            flags.push("degraded_context".into());
        }
        let media_url = draft.media.as_ref().map(|m| m.url.clone());

        self.deliver_full(
            event,
            &outbound,
            &working_body,
            &language,
            &handlers,
            &flags,
            media_url.as_deref(),
        )
        .await
    }

    /// Translate a working-language reply back to the user's language.
    /// Failure falls back to the untranslated reply.
    async fn localize(&self, reply: &str, language: &str) -> String {
        if language == self.deps.config.working_language {
            return reply.to_string();
        }
        match self
            .bounded(self.deps.language.translate(
                reply,
                &self.deps.config.working_language,
                language,
            ))
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                warn!(error = %e, "Outbound translation failed, sending untranslated reply");
                reply.to_string()
            }
        }
    }

    /// Deliver a reply that used no capability handlers (onboarding prompts
    /// and emergency escalations). The recorded inbound text is the raw
    /// event body.
    async fn deliver(
        &self,
        event: &InboundEvent,
        outbound: &str,
        language: &str,
        flags: &[String],
    ) -> Result<(), Error> {
        self.deliver_full(event, outbound, &event.body, language, &[], flags, None)
            .await
    }

    /// Send the reply, record the chat turn, and mark the event delivered.
    ///
    /// A send failure marks the event `Failed` (no automatic retry beyond
    /// the pipeline's own capability retries). The turn is recorded only
    /// after a successful send so a `Failed` event never has a turn.
    async fn deliver_full(
        &self,
        event: &InboundEvent,
        outbound: &str,
        inbound_working: &str,
        language: &str,
        handlers: &[String],
        flags: &[String],
        media_url: Option<&str>,
    ) -> Result<(), Error> {
        let send = self.deps.channel.send(&event.sender, outbound, media_url);
        let sent = tokio::time::timeout(self.deps.config.call_timeout, send)
            .await
            .map_err(|_| ChannelError::SendFailed {
                name: self.deps.channel.name().to_string(),
                reason: "send timed out".to_string(),
            })
            .and_then(|r| r);

        match sent {
            Ok(delivery_id) => {
                let turn = ChatTurn {
                    id: None,
                    phone: event.sender.clone(),
                    inbound_text: inbound_working.to_string(),
                    outbound_text: outbound.to_string(),
                    language: language.to_string(),
                    handlers: handlers.to_vec(),
                    safety_flags: flags.to_vec(),
                    created_at: chrono::Utc::now(),
                };
                // The reply is already out; a history write failure must
                // not fail the event.
                if let Err(e) = self.deps.sessions.append(&turn).await {
                    error!(event_id = %event.id, error = %e, "Failed to record chat turn");
                }
                self.deps
                    .events
                    .mark(&event.id, EventState::Delivered, None)
                    .await?;
                info!(event_id = %event.id, delivery_id, "Reply delivered");
                Ok(())
            }
            Err(e) => {
                self.deps
                    .events
                    .mark(&event.id, EventState::Failed, Some(&e.to_string()))
                    .await?;
                error!(event_id = %event.id, error = %e, "Delivery failed");
                Ok(())
            }
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, crate::error::CapabilityError>>,
    ) -> Result<T, crate::error::CapabilityError> {
        tokio::time::timeout(self.deps.config.call_timeout, fut)
            .await
            .map_err(|_| crate::error::CapabilityError::Timeout {
                name: "language".to_string(),
                timeout: self.deps.config.call_timeout,
            })?
    }
}

fn fallback_language(profile: &UserProfile) -> String {
    if profile.language.is_empty() {
        "en".to_string()
    } else {
        profile.language.clone()
    }
}

/// Handler warnings first, validator warnings after, order preserved.
fn merge_warnings(draft: &DraftReply, validator_warnings: Vec<String>) -> Vec<String> {
    let mut warnings = draft.warnings.clone();
    warnings.extend(validator_warnings);
    warnings
}
