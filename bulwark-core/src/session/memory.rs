//! In-memory session store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Session, SessionState, SessionStore, StateDelta};
use crate::error::{ErrorRecord, Result, SessionFailure, SessionOperation};

type SessionKey = (String, String, String);

fn key(app_name: &str, user_id: &str, session_id: &str) -> SessionKey {
    (
        app_name.to_string(),
        user_id.to_string(),
        session_id.to_string(),
    )
}

/// Session store backed by a `HashMap`
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<SessionState>,
    ) -> Result<Session> {
        let session = Session::new(app_name, user_id, state);
        self.sessions.write().await.insert(
            key(app_name, user_id, &session.id),
            session.clone(),
        );
        Ok(session)
    }

    async fn get(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(&key(app_name, user_id, session_id))
            .cloned())
    }

    async fn update(
        &self,
        session: &Session,
        delta: &StateDelta,
        expected_version: u64,
    ) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&key(&session.app_name, &session.user_id, &session.id))
            .ok_or_else(|| {
                ErrorRecord::session(
                    SessionOperation::Update,
                    SessionFailure::NotFound,
                    &session.id,
                    "Session not found",
                )
            })?;

        if stored.version != expected_version {
            return Err(ErrorRecord::version_conflict(
                &session.id,
                expected_version,
                stored.version,
            ));
        }

        delta.apply(&mut stored.state);
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete(&self, app_name: &str, user_id: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .sessions
            .write()
            .await
            .remove(&key(app_name, user_id, session_id))
            .is_some())
    }

    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.app_name == app_name && s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}
