//! Versioned session store contract
//!
//! Sessions carry a JSON object of state and a version number. Every
//! accepted update increments the version by exactly one, and updates are
//! only accepted when the caller's expected version matches the stored one.

mod memory;

pub use memory::InMemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Session state object
pub type SessionState = Map<String, Value>;

/// A stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub state: SessionState,
    /// Starts at 0 and increases by one per accepted update
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a version-0 session with a fresh id
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        state: Option<SessionState>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            app_name: app_name.into(),
            user_id: user_id.into(),
            state: state.unwrap_or_default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get a state value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }
}

/// A change to session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "state", rename_all = "snake_case")]
pub enum StateDelta {
    /// Replace the whole state
    Set(SessionState),
    /// Overwrite the given top-level keys, keeping the rest
    Merge(SessionState),
}

impl StateDelta {
    /// Apply the delta to `state`
    pub fn apply(&self, state: &mut SessionState) {
        match self {
            StateDelta::Set(next) => *state = next.clone(),
            StateDelta::Merge(changes) => {
                for (key, value) in changes {
                    state.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Build a merge delta from a JSON object; other values merge nothing
    pub fn merge(value: Value) -> Self {
        match value {
            Value::Object(map) => StateDelta::Merge(map),
            _ => StateDelta::Merge(Map::new()),
        }
    }

    /// Build a set delta from a JSON object; other values clear the state
    pub fn set(value: Value) -> Self {
        match value {
            Value::Object(map) => StateDelta::Set(map),
            _ => StateDelta::Set(Map::new()),
        }
    }
}

/// Backing store for sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session at version 0
    async fn create(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<SessionState>,
    ) -> Result<Session>;

    /// Fetch a session; `None` if it does not exist
    async fn get(&self, app_name: &str, user_id: &str, session_id: &str)
    -> Result<Option<Session>>;

    /// Apply `delta` if the stored version equals `expected_version`.
    ///
    /// The compare and the write are atomic. Fails with a version conflict
    /// on mismatch and with `NotFound` if the session is gone.
    async fn update(
        &self,
        session: &Session,
        delta: &StateDelta,
        expected_version: u64,
    ) -> Result<Session>;

    /// Delete a session; returns whether it existed
    async fn delete(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<bool>;

    /// All sessions for a user, oldest first
    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>>;
}
