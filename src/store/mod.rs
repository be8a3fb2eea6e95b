//! Persistence: profiles, chat history, and event idempotency state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ChatTurn, EventState, EventStore, ProfileStore, SessionStore, StoredEvent};
