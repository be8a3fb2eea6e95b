//! HTTP surface: the inbound webhook plus the admin endpoints.
//!
//! The webhook always acknowledges immediately (empty TwiML) regardless of
//! pipeline outcome; processing happens in the background through the
//! delivery coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::channels::{whatsapp::normalize_phone, MessagingChannel, TwilioWhatsApp};
use crate::delivery::DeliveryCoordinator;
use crate::services::retrieval::user_namespace;
use crate::services::RetrievalService;
use crate::store::{ProfileStore, SessionStore};

/// Empty TwiML acknowledgment body.
const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

/// Shared state behind every route.
pub struct AppState {
    pub coordinator: Arc<DeliveryCoordinator>,
    pub profiles: Arc<dyn ProfileStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub retrieval: Arc<dyn RetrievalService>,
    pub channel: Arc<dyn MessagingChannel>,
    pub started_at: DateTime<Utc>,
}

/// Build the full route tree.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/webhook/whatsapp", post(whatsapp_webhook))
        .route("/api/user/{phone}", get(get_user).delete(delete_user))
        .route("/api/stats", get(stats))
        .route("/api/send-message", post(send_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn banner() -> impl IntoResponse {
    format!("Arogya Bot v{}", env!("CARGO_PKG_VERSION"))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let channel_ok = state.channel.health_check().await.is_ok();
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(serde_json::json!({
        "status": if channel_ok { "ok" } else { "degraded" },
        "channel": channel_ok,
        "uptime_secs": uptime,
    }))
}

/// Inbound WhatsApp webhook. Always acknowledges with empty TwiML within
/// this handler — the upstream provider retries on timeouts, and the
/// idempotent claim makes those retries harmless.
async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    match TwilioWhatsApp::parse_webhook(&form) {
        Ok(event) => {
            info!(event_id = %event.id, sender = %event.sender, "Webhook event received");
            if let Err(e) = state.coordinator.accept(event).await {
                error!(error = %e, "Failed to accept webhook event");
            }
        }
        Err(e) => {
            warn!(error = %e, "Unparseable webhook payload");
        }
    }
    ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML)
}

/// Admin: fetch a profile with the medical-history free text redacted.
async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
) -> impl IntoResponse {
    let phone = normalize_path_phone(&phone);
    match state.profiles.get(&phone).await {
        Ok(Some(profile)) => {
            let redacted = redact_profile(serde_json::to_value(&profile).unwrap_or_default());
            (StatusCode::OK, Json(redacted))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "user not found"})),
        ),
        Err(e) => {
            error!(error = %e, "Profile lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "store failure"})),
            )
        }
    }
}

/// Admin: irreversible erasure of a user across all stores.
async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(phone): Path<String>,
) -> impl IntoResponse {
    let phone = normalize_path_phone(&phone);

    let deleted = match state.profiles.delete(&phone).await {
        Ok(deleted) => deleted,
        Err(e) => {
            error!(error = %e, "Profile deletion failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "store failure"})),
            );
        }
    };

    let turns_deleted = match state.sessions.delete_for(&phone).await {
        Ok(count) => count,
        Err(e) => {
            error!(error = %e, "Chat history deletion failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "store failure"})),
            );
        }
    };

    if let Err(e) = state.retrieval.erase_namespace(&user_namespace(&phone)).await {
        // The stores are already clean; report the partial failure.
        error!(error = %e, "Retrieval namespace erasure failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "namespace erasure failure"})),
        );
    }

    info!(phone, deleted, turns_deleted, "User data erased");
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "deleted": deleted,
            "chat_turns_deleted": turns_deleted,
        })),
    )
}

/// Admin: derived read-only aggregates from the stores. No separately
/// mutated counters exist; the stores are the single source of truth.
async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state.profiles.count().await.unwrap_or(0);
    let completed = state.profiles.count_completed().await.unwrap_or(0);
    let turns = state.sessions.count().await.unwrap_or(0);
    let since = Utc::now() - chrono::Duration::hours(24);
    let turns_24h = state.sessions.count_since(since).await.unwrap_or(0);

    Json(serde_json::json!({
        "users": users,
        "onboarding_completed": completed,
        "chat_turns": turns,
        "chat_turns_24h": turns_24h,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct SendMessageRequest {
    to: String,
    body: String,
}

/// Admin: direct send for operational testing.
async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> impl IntoResponse {
    let to = normalize_phone(&request.to);
    match state.channel.send(&to, &request.body, None).await {
        Ok(delivery_id) => (
            StatusCode::OK,
            Json(serde_json::json!({"delivery_id": delivery_id})),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Accept path phones with or without the leading `+` (it is often lost
/// to URL encoding).
fn normalize_path_phone(raw: &str) -> String {
    let trimmed = raw.trim().replace(' ', "");
    let trimmed = normalize_phone(&trimmed);
    if trimmed.starts_with('+') {
        trimmed
    } else {
        format!("+{trimmed}")
    }
}

/// Blank out the medical-history free text for admin reads.
fn redact_profile(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        let redact = obj
            .get("medical_history")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if redact {
            obj.insert(
                "medical_history".to_string(),
                serde_json::Value::String("[redacted]".to_string()),
            );
        }
    }
    value
}
