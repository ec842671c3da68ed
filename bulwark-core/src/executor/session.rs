//! Session store executor

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use super::{ExecutionPolicy, ExecutionResult, Guarded, Operation, OperationKind, ResourceUsage};
use crate::error::{ErrorKind, ErrorRecord, Result, SessionFailure, SessionOperation};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::session::{Session, SessionState, SessionStore, StateDelta};
use crate::telemetry::Telemetry;

/// Runs session store calls under the shared policy layers
///
/// The breaker is keyed per application (`session:<app_name>`), since one
/// store backs every session of an app.
pub struct SessionExecutor {
    store: Arc<dyn SessionStore>,
    breaker: Arc<CircuitBreaker>,
    policy: ExecutionPolicy,
    telemetry: Telemetry,
}

impl std::fmt::Debug for SessionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SessionExecutor {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            breaker: Arc::new(CircuitBreaker::default()),
            policy: ExecutionPolicy::default().with_timeout(Duration::from_secs(5)),
            telemetry: Telemetry::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Create a session at version 0
    pub async fn create(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<SessionState>,
    ) -> Result<ExecutionResult<Session>> {
        let input = json!({ "app_name": app_name, "user_id": user_id, "state": state });
        self.guarded(SessionOperation::Create, app_name, user_id, input, |_| {
            self.store.create(app_name, user_id, state.clone())
        })
        .await
    }

    /// Fetch a session; `None` if it does not exist
    pub async fn get(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<ExecutionResult<Option<Session>>> {
        let input = json!({ "app_name": app_name, "user_id": user_id });
        self.guarded(SessionOperation::Get, app_name, session_id, input, |_| {
            self.store.get(app_name, user_id, session_id)
        })
        .await
    }

    /// Apply `delta` if the store is still at `expected_version`.
    ///
    /// On success the returned session's version is exactly one higher.
    pub async fn update(
        &self,
        session: &Session,
        delta: StateDelta,
        expected_version: u64,
    ) -> Result<ExecutionResult<Session>> {
        let input = json!({ "delta": delta, "expected_version": expected_version });
        self.guarded(
            SessionOperation::Update,
            &session.app_name,
            &session.id,
            input,
            |_| self.update_checked(session, &delta, expected_version),
        )
        .await
    }

    /// Delete a session; the output says whether it existed
    pub async fn delete(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<ExecutionResult<bool>> {
        let input = json!({ "app_name": app_name, "user_id": user_id });
        self.guarded(SessionOperation::Delete, app_name, session_id, input, |_| {
            self.store.delete(app_name, user_id, session_id)
        })
        .await
    }

    /// All sessions for a user
    pub async fn list(&self, app_name: &str, user_id: &str) -> Result<ExecutionResult<Vec<Session>>> {
        let input = json!({ "app_name": app_name, "user_id": user_id });
        self.guarded(SessionOperation::List, app_name, user_id, input, |_| {
            self.store.list(app_name, user_id)
        })
        .await
    }

    async fn update_checked(
        &self,
        session: &Session,
        delta: &StateDelta,
        expected_version: u64,
    ) -> Result<Session> {
        let current = self
            .store
            .get(&session.app_name, &session.user_id, &session.id)
            .await?
            .ok_or_else(|| {
                ErrorRecord::session(
                    SessionOperation::Update,
                    SessionFailure::NotFound,
                    &session.id,
                    "Session not found",
                )
            })?;

        if current.version != expected_version {
            return Err(ErrorRecord::version_conflict(
                &session.id,
                expected_version,
                current.version,
            ));
        }

        self.store.update(session, delta, expected_version).await
    }

    async fn guarded<T, F, Fut>(
        &self,
        op: SessionOperation,
        app_name: &str,
        target: &str,
        input: Value,
        call: F,
    ) -> Result<ExecutionResult<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let operation = Operation::new(OperationKind::Session, target, input, self.policy.deadline);
        let breaker_key = format!("session:{}", app_name);

        let circuit_open = || {
            ErrorRecord::session(
                op,
                SessionFailure::CircuitOpen,
                target,
                format!("Circuit open for session store of '{}'", app_name),
            )
        };
        let timeout_error = |limit: Duration, _elapsed: Duration| {
            ErrorRecord::session(
                op,
                SessionFailure::Timeout,
                target,
                format!("Session {} timed out after {:?}", op, limit),
            )
        };

        let completed = Guarded {
            operation: &operation,
            policy: &self.policy,
            breaker: &self.breaker,
            breaker_key: &breaker_key,
            telemetry: &self.telemetry,
            circuit_open: &circuit_open,
            timeout_error: &timeout_error,
            counts_failure: counts_against_breaker,
        }
        .run(call)
        .await?;

        Ok(ExecutionResult {
            output: completed.value,
            elapsed: completed.elapsed,
            attempts: completed.attempts,
            usage: ResourceUsage::default(),
        })
    }
}

/// Only store-side failures reflect the store's health
fn counts_against_breaker(error: &ErrorRecord) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Session {
            failure: SessionFailure::Store | SessionFailure::Timeout,
            ..
        }
    )
}
