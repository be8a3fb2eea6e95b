//! libSQL backend — async implementation of all three store traits.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pipeline::types::{InboundEvent, MediaRef};
use crate::profile::{Gender, OnboardingStep, UserProfile};
use crate::store::migrations;
use crate::store::traits::{
    ChatTurn, EventState, EventStore, ProfileStore, SessionStore, StoredEvent,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn to_json(value: &impl serde::Serialize) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn vec_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn media_from_json(raw: &str) -> Vec<MediaRef> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn gender_to_str(gender: Option<Gender>) -> Option<String> {
    gender.map(|g| g.to_string())
}

fn gender_from_str(raw: Option<String>) -> Option<Gender> {
    raw.as_deref().and_then(Gender::parse)
}

/// Map a libsql Row to a UserProfile.
///
/// Column order: 0:phone, 1:name, 2:age, 3:gender, 4:district, 5:state,
/// 6:language, 7:emergency_contact, 8:allergies, 9:medications,
/// 10:medical_history, 11:onboarding_step, 12:onboarding_completed,
/// 13:created_at, 14:updated_at
fn row_to_profile(row: &libsql::Row) -> Result<UserProfile, StoreError> {
    let bad = |e: libsql::Error| StoreError::Query(format!("profile row: {e}"));

    let step_str: String = row.get(11).map_err(bad)?;
    let step: OnboardingStep = step_str
        .parse()
        .map_err(|e: String| StoreError::Serialization(e))?;

    Ok(UserProfile {
        phone: row.get(0).map_err(bad)?,
        name: row.get(1).map_err(bad)?,
        age: row.get::<i64>(2).ok().map(|v| v as u32),
        gender: gender_from_str(row.get::<String>(3).ok()),
        district: row.get(4).map_err(bad)?,
        state: row.get(5).map_err(bad)?,
        language: row.get(6).map_err(bad)?,
        emergency_contact: row.get(7).map_err(bad)?,
        allergies: vec_from_json(&row.get::<String>(8).map_err(bad)?),
        medications: vec_from_json(&row.get::<String>(9).map_err(bad)?),
        medical_history: row.get(10).map_err(bad)?,
        onboarding_step: step,
        onboarding_completed: row.get::<i64>(12).map_err(bad)? != 0,
        created_at: parse_datetime(&row.get::<String>(13).map_err(bad)?),
        updated_at: parse_datetime(&row.get::<String>(14).map_err(bad)?),
    })
}

/// Column order: 0:id, 1:phone, 2:inbound_text, 3:outbound_text,
/// 4:language, 5:handlers, 6:safety_flags, 7:created_at
fn row_to_turn(row: &libsql::Row) -> Result<ChatTurn, StoreError> {
    let bad = |e: libsql::Error| StoreError::Query(format!("chat turn row: {e}"));
    Ok(ChatTurn {
        id: Some(row.get(0).map_err(bad)?),
        phone: row.get(1).map_err(bad)?,
        inbound_text: row.get(2).map_err(bad)?,
        outbound_text: row.get(3).map_err(bad)?,
        language: row.get(4).map_err(bad)?,
        handlers: vec_from_json(&row.get::<String>(5).map_err(bad)?),
        safety_flags: vec_from_json(&row.get::<String>(6).map_err(bad)?),
        created_at: parse_datetime(&row.get::<String>(7).map_err(bad)?),
    })
}

/// Column order: 0:id, 1:sender, 2:body, 3:media, 4:received_at, 5:state,
/// 6:attempts, 7:reason, 8:updated_at
fn row_to_event(row: &libsql::Row) -> Result<StoredEvent, StoreError> {
    let bad = |e: libsql::Error| StoreError::Query(format!("event row: {e}"));
    let state_str: String = row.get(5).map_err(bad)?;
    Ok(StoredEvent {
        event: InboundEvent {
            id: row.get(0).map_err(bad)?,
            sender: row.get(1).map_err(bad)?,
            body: row.get(2).map_err(bad)?,
            media: media_from_json(&row.get::<String>(3).map_err(bad)?),
            received_at: parse_datetime(&row.get::<String>(4).map_err(bad)?),
        },
        state: state_str
            .parse()
            .map_err(|e: String| StoreError::Serialization(e))?,
        attempts: row.get::<i64>(6).map_err(bad)? as u32,
        reason: row.get::<String>(7).ok().filter(|r| !r.is_empty()),
        updated_at: parse_datetime(&row.get::<String>(8).map_err(bad)?),
    })
}

async fn count_query(conn: &Connection, sql: &str) -> Result<u64, StoreError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| StoreError::Query(format!("count: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| StoreError::Query(format!("count row: {e}")))?
    {
        Some(row) => Ok(row
            .get::<i64>(0)
            .map_err(|e| StoreError::Query(format!("count value: {e}")))?
            as u64),
        None => Ok(0),
    }
}

// ── ProfileStore ────────────────────────────────────────────────────

#[async_trait]
impl ProfileStore for LibSqlBackend {
    async fn get(&self, phone: &str) -> Result<Option<UserProfile>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT phone, name, age, gender, district, state, language,
                        emergency_contact, allergies, medications, medical_history,
                        onboarding_step, onboarding_completed, created_at, updated_at
                 FROM profiles WHERE phone = ?1",
                params![phone],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get profile: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get profile row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_profile(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO profiles
                    (phone, name, age, gender, district, state, language,
                     emergency_contact, allergies, medications, medical_history,
                     onboarding_step, onboarding_completed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    profile.phone.clone(),
                    profile.name.clone(),
                    profile.age.map(|a| a as i64),
                    gender_to_str(profile.gender),
                    profile.district.clone(),
                    profile.state.clone(),
                    profile.language.clone(),
                    profile.emergency_contact.clone(),
                    to_json(&profile.allergies)?,
                    to_json(&profile.medications)?,
                    profile.medical_history.clone(),
                    profile.onboarding_step.to_string(),
                    profile.onboarding_completed as i64,
                    profile.created_at.to_rfc3339(),
                    profile.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert profile: {e}")))?;
        debug!(phone = %profile.phone, step = %profile.onboarding_step, "Profile upserted");
        Ok(())
    }

    async fn delete(&self, phone: &str) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM profiles WHERE phone = ?1", params![phone])
            .await
            .map_err(|e| StoreError::Query(format!("delete profile: {e}")))?;
        Ok(affected > 0)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        count_query(self.conn(), "SELECT COUNT(*) FROM profiles").await
    }

    async fn count_completed(&self) -> Result<u64, StoreError> {
        count_query(
            self.conn(),
            "SELECT COUNT(*) FROM profiles WHERE onboarding_completed = 1",
        )
        .await
    }
}

// ── SessionStore ────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn append(&self, turn: &ChatTurn) -> Result<(), StoreError> {
        let id = turn
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.conn()
            .execute(
                "INSERT INTO chat_turns
                    (id, phone, inbound_text, outbound_text, language, handlers,
                     safety_flags, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    turn.phone.clone(),
                    turn.inbound_text.clone(),
                    turn.outbound_text.clone(),
                    turn.language.clone(),
                    to_json(&turn.handlers)?,
                    to_json(&turn.safety_flags)?,
                    turn.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append turn: {e}")))?;
        Ok(())
    }

    async fn recent(&self, phone: &str, n: usize) -> Result<Vec<ChatTurn>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, phone, inbound_text, outbound_text, language, handlers,
                        safety_flags, created_at
                 FROM chat_turns WHERE phone = ?1
                 ORDER BY created_at DESC LIMIT ?2",
                params![phone, n as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent turns: {e}")))?;

        let mut turns = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("recent turn row: {e}")))?
        {
            turns.push(row_to_turn(&row)?);
        }
        turns.reverse(); // oldest first
        Ok(turns)
    }

    async fn delete_for(&self, phone: &str) -> Result<usize, StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM chat_turns WHERE phone = ?1", params![phone])
            .await
            .map_err(|e| StoreError::Query(format!("delete turns: {e}")))?;
        Ok(affected as usize)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        count_query(self.conn(), "SELECT COUNT(*) FROM chat_turns").await
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM chat_turns WHERE created_at >= ?1",
                params![since.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("count since: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("count since row: {e}")))?
        {
            Some(row) => Ok(row
                .get::<i64>(0)
                .map_err(|e| StoreError::Query(format!("count since value: {e}")))?
                as u64),
            None => Ok(0),
        }
    }
}

// ── EventStore ──────────────────────────────────────────────────────

#[async_trait]
impl EventStore for LibSqlBackend {
    async fn claim(&self, event: &InboundEvent) -> Result<bool, StoreError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO events
                    (id, sender, body, media, received_at, state, attempts, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'processing', 1, ?6)",
                params![
                    event.id.clone(),
                    event.sender.clone(),
                    event.body.clone(),
                    to_json(&event.media)?,
                    event.received_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim event: {e}")))?;
        Ok(inserted > 0)
    }

    async fn mark(
        &self,
        event_id: &str,
        state: EventState,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE events SET state = ?1, reason = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    state.to_string(),
                    reason.map(|r| r.to_string()),
                    Utc::now().to_rfc3339(),
                    event_id,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark event: {e}")))?;
        debug!(event_id, state = %state, "Event state updated");
        Ok(())
    }

    async fn state_of(&self, event_id: &str) -> Result<Option<EventState>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state FROM events WHERE id = ?1",
                params![event_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("event state: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("event state row: {e}")))?
        {
            Some(row) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("event state value: {e}")))?;
                Ok(Some(
                    raw.parse()
                        .map_err(|e: String| StoreError::Serialization(e))?,
                ))
            }
            None => Ok(None),
        }
    }

    async fn incomplete(&self) -> Result<Vec<StoredEvent>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, sender, body, media, received_at, state, attempts, reason,
                        updated_at
                 FROM events WHERE state = 'processing'
                 ORDER BY received_at ASC",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("incomplete events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("incomplete event row: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn record_attempt(&self, event_id: &str) -> Result<u32, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE events SET attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2 RETURNING attempts",
                params![Utc::now().to_rfc3339(), event_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record attempt: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("record attempt row: {e}")))?
        {
            Some(row) => Ok(row
                .get::<i64>(0)
                .map_err(|e| StoreError::Query(format!("attempt value: {e}")))?
                as u32),
            None => Err(StoreError::NotFound {
                entity: "event".into(),
                key: event_id.to_string(),
            }),
        }
    }
}
