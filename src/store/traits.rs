//! Store traits — async persistence interfaces for the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pipeline::types::InboundEvent;
use crate::profile::UserProfile;

/// One message/response pair, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: Option<String>,
    pub phone: String,
    /// Inbound text in the pipeline's working language.
    pub inbound_text: String,
    pub outbound_text: String,
    /// Detected language code of the original inbound message.
    pub language: String,
    /// Capability names used for this turn.
    pub handlers: Vec<String>,
    /// Safety flags raised ("emergency", warning texts).
    pub safety_flags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-event processing state, persisted for idempotency.
///
/// `Delivered` and `Failed` are terminal. `Unseen` is the implicit state of
/// an id with no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Unseen,
    Processing,
    Delivered,
    Failed,
}

impl EventState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, target),
            (Unseen, Processing) | (Processing, Delivered) | (Processing, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unseen => "unseen",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unseen" => Ok(Self::Unseen),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event state: '{other}'")),
        }
    }
}

/// A persisted event row: the immutable event plus its processing state.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: InboundEvent,
    pub state: EventState,
    pub attempts: u32,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Profile persistence, keyed by phone number.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, phone: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Write the full profile row. One statement, so concurrent readers
    /// never observe a half-updated profile.
    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError>;

    /// Irreversibly delete a profile. Returns whether a row existed.
    async fn delete(&self, phone: &str) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn count_completed(&self) -> Result<u64, StoreError>;
}

/// Chat history persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append(&self, turn: &ChatTurn) -> Result<(), StoreError>;

    /// The most recent `n` turns for a phone, oldest first.
    async fn recent(&self, phone: &str, n: usize) -> Result<Vec<ChatTurn>, StoreError>;

    /// Delete all turns for a phone (profile erasure). Returns count.
    async fn delete_for(&self, phone: &str) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Event idempotency and crash-recovery state.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Claim an event id for processing. Returns false if the id was seen
    /// before (any state) — the caller must not process it again.
    async fn claim(&self, event: &InboundEvent) -> Result<bool, StoreError>;

    /// Move an event to a new state.
    async fn mark(
        &self,
        event_id: &str,
        state: EventState,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn state_of(&self, event_id: &str) -> Result<Option<EventState>, StoreError>;

    /// Events still `Processing` (candidates for startup recovery).
    async fn incomplete(&self) -> Result<Vec<StoredEvent>, StoreError>;

    /// Bump and return the attempt counter for an event.
    async fn record_attempt(&self, event_id: &str) -> Result<u32, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_state_transitions() {
        use EventState::*;
        assert!(Unseen.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Delivered));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Delivered.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Unseen.can_transition_to(Delivered));
    }

    #[test]
    fn terminal_states() {
        assert!(EventState::Delivered.is_terminal());
        assert!(EventState::Failed.is_terminal());
        assert!(!EventState::Processing.is_terminal());
        assert!(!EventState::Unseen.is_terminal());
    }

    #[test]
    fn event_state_display_roundtrip() {
        for state in [
            EventState::Unseen,
            EventState::Processing,
            EventState::Delivered,
            EventState::Failed,
        ] {
            let text = state.to_string();
            assert_eq!(text.parse::<EventState>().unwrap(), state);
        }
        assert!("bogus".parse::<EventState>().is_err());
    }
}
