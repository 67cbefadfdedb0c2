//! Authoritative session table.
//!
//! Each session sits behind its own async mutex so transitions for one
//! session are serialized without blocking any other session. The DashMap
//! guard is never held across an await: handles are cloned out first.

use std::sync::Arc;

use {
    chrono::{DateTime, Utc},
    dashmap::DashMap,
    serde::Serialize,
    switchboard_channels::ConversationRef,
    switchboard_common::{BackendKind, ClientIdentity, SessionId},
    tokio::sync::Mutex,
    tracing::{info, warn},
};

use crate::{
    error::{Error, Result},
    state::{SessionEvent, SessionState, next_state},
};

/// Snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub client: ClientIdentity,
    pub state: SessionState,
    pub assistant_ref: Option<ConversationRef>,
    pub agent_ref: Option<String>,
    /// Set while the active backend's poll loop is in a failure streak.
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(client: ClientIdentity) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            client,
            state: SessionState::Idle,
            assistant_ref: None,
            agent_ref: None,
            degraded: false,
            created_at: now,
            last_activity: now,
            ended_at: None,
        }
    }

    /// Backend currently receiving client messages.
    pub fn active_route(&self) -> Option<BackendKind> {
        self.state.route()
    }

    /// Backend-side reference for `backend`, if attached.
    pub fn reference(&self, backend: BackendKind) -> Option<&str> {
        match backend {
            BackendKind::Assistant => self
                .assistant_ref
                .as_ref()
                .map(|c| c.conversation_id.as_str()),
            BackendKind::Agent => self.agent_ref.as_deref(),
        }
    }
}

type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    /// Backend reference -> owning session.
    refs: DashMap<(BackendKind, String), SessionId>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            refs: DashMap::new(),
        }
    }

    fn handle(&self, session_id: &SessionId) -> Result<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::not_found(session_id))
    }

    /// Register a new `Idle` session.
    pub fn create_session(&self, client: ClientIdentity) -> Session {
        let session = Session::new(client);
        info!(session_id = %session.id, client_id = %session.client.id, "session created");
        self.sessions
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        session
    }

    pub async fn lookup(&self, session_id: &SessionId) -> Result<Session> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Apply `event`. Illegal transitions leave the session untouched.
    pub async fn transition(&self, session_id: &SessionId, event: SessionEvent) -> Result<Session> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        let from = session.state;

        let Some(to) = next_state(from, &event) else {
            warn!(
                session_id = %session_id,
                from = %from,
                event = event.name(),
                "rejected session transition"
            );
            return Err(Error::InvalidTransition {
                session_id: session_id.clone(),
                from,
                event: event.name(),
            });
        };

        let event_name = event.name();
        match event {
            SessionEvent::StartAssistant { conversation } => {
                self.refs.insert(
                    (BackendKind::Assistant, conversation.conversation_id.clone()),
                    session_id.clone(),
                );
                session.assistant_ref = Some(conversation);
            },
            SessionEvent::AgentEstablished { agent_session } => {
                self.refs
                    .insert((BackendKind::Agent, agent_session.clone()), session_id.clone());
                session.agent_ref = Some(agent_session);
                session.degraded = false;
            },
            SessionEvent::AgentEstablishFailed => {
                session.agent_ref = None;
            },
            SessionEvent::HandoffTriggered
            | SessionEvent::AgentEndedChat
            | SessionEvent::ClientDisconnect => {},
        }

        let now = Utc::now();
        session.state = to;
        session.last_activity = now;
        if to.is_terminal() {
            session.ended_at = Some(now);
        }
        info!(session_id = %session_id, from = %from, to = %to, event = event_name, "session transition");
        Ok(session.clone())
    }

    /// Map a backend-side reference (or a raw session id) to its session.
    pub fn resolve(&self, backend: BackendKind, reference: &str) -> Option<SessionId> {
        if let Some(id) = self.refs.get(&(backend, reference.to_string())) {
            return Some(id.value().clone());
        }
        let as_session = SessionId::from(reference);
        self.sessions
            .contains_key(&as_session)
            .then_some(as_session)
    }

    pub async fn touch(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.handle(session_id)?;
        handle.lock().await.last_activity = Utc::now();
        Ok(())
    }

    /// Set the degraded flag. Returns `true` when the flag actually changed.
    pub async fn set_degraded(&self, session_id: &SessionId, degraded: bool) -> Result<bool> {
        let handle = self.handle(session_id)?;
        let mut session = handle.lock().await;
        if session.degraded == degraded || session.state.is_terminal() {
            return Ok(false);
        }
        session.degraded = degraded;
        Ok(true)
    }

    /// Current state without cloning the whole session.
    pub async fn state(&self, session_id: &SessionId) -> Result<SessionState> {
        let handle = self.handle(session_id)?;
        let state = handle.lock().await.state;
        Ok(state)
    }

    /// Remove sessions that ended more than `retention` before `now`.
    pub async fn collect_expired(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<SessionId> {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut expired = Vec::new();
        for (id, handle) in handles {
            let session = handle.lock().await;
            if let Some(ended_at) = session.ended_at
                && ended_at + retention <= now
            {
                for backend in [BackendKind::Assistant, BackendKind::Agent] {
                    if let Some(reference) = session.reference(backend) {
                        self.refs.remove(&(backend, reference.to_string()));
                    }
                }
                expired.push(id);
            }
        }
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions not yet `Ended`.
    pub async fn active_count(&self) -> usize {
        let handles: Vec<SessionHandle> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut count = 0;
        for handle in handles {
            if !handle.lock().await.state.is_terminal() {
                count += 1;
            }
        }
        count
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::Secret};

    fn conversation(id: &str) -> ConversationRef {
        ConversationRef::new(id, Secret::new("token".into()))
    }

    async fn assistant_active(registry: &SessionRegistry) -> SessionId {
        let session = registry.create_session(ClientIdentity::new("u1"));
        registry
            .transition(&session.id, SessionEvent::StartAssistant {
                conversation: conversation("conv-1"),
            })
            .await
            .unwrap();
        session.id
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let registry = SessionRegistry::new();
        let id = assistant_active(&registry).await;

        registry
            .transition(&id, SessionEvent::HandoffTriggered)
            .await
            .unwrap();
        let session = registry
            .transition(&id, SessionEvent::AgentEstablished {
                agent_session: "abc123".into(),
            })
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::AgentActive);
        assert_eq!(session.active_route(), Some(BackendKind::Agent));
        assert_eq!(registry.resolve(BackendKind::Agent, "abc123"), Some(id.clone()));

        let ended = registry
            .transition(&id, SessionEvent::AgentEndedChat)
            .await
            .unwrap();
        assert_eq!(ended.state, SessionState::Ended);
        assert!(ended.ended_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_unchanged() {
        let registry = SessionRegistry::new();
        let id = assistant_active(&registry).await;

        let err = registry
            .transition(&id, SessionEvent::AgentEstablished {
                agent_session: "abc123".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());

        let session = registry.lookup(&id).await.unwrap();
        assert_eq!(session.state, SessionState::AssistantActive);
        assert!(session.agent_ref.is_none());
        assert_eq!(registry.resolve(BackendKind::Agent, "abc123"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_handoff_triggers_yield_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let id = assistant_active(&registry).await;

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move {
                    registry
                        .transition(&id, SessionEvent::HandoffTriggered)
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut invalid = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) if e.is_invalid_transition() => invalid += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, invalid), (1, 1));
        assert_eq!(
            registry.state(&id).await.unwrap(),
            SessionState::HandoffInProgress
        );
    }

    #[tokio::test]
    async fn rollback_returns_to_assistant() {
        let registry = SessionRegistry::new();
        let id = assistant_active(&registry).await;
        registry
            .transition(&id, SessionEvent::HandoffTriggered)
            .await
            .unwrap();
        let session = registry
            .transition(&id, SessionEvent::AgentEstablishFailed)
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::AssistantActive);
        assert_eq!(session.reference(BackendKind::Assistant), Some("conv-1"));
    }

    #[tokio::test]
    async fn lookup_unknown_is_not_found() {
        let registry = SessionRegistry::new();
        let err = registry.lookup(&SessionId::from("nope")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn resolve_accepts_raw_session_ids() {
        let registry = SessionRegistry::new();
        let id = assistant_active(&registry).await;
        assert_eq!(registry.resolve(BackendKind::Agent, id.as_str()), Some(id.clone()));
        assert_eq!(
            registry.resolve(BackendKind::Assistant, "conv-1"),
            Some(id)
        );
        assert_eq!(registry.resolve(BackendKind::Assistant, "conv-2"), None);
    }

    #[tokio::test]
    async fn degraded_flag_reports_changes_only() {
        let registry = SessionRegistry::new();
        let id = assistant_active(&registry).await;
        assert!(registry.set_degraded(&id, true).await.unwrap());
        assert!(!registry.set_degraded(&id, true).await.unwrap());
        assert!(registry.set_degraded(&id, false).await.unwrap());
    }

    #[tokio::test]
    async fn collects_only_expired_ended_sessions() {
        let registry = SessionRegistry::new();
        let ended = assistant_active(&registry).await;
        let live = registry.create_session(ClientIdentity::new("u2")).id;
        registry
            .transition(&ended, SessionEvent::ClientDisconnect)
            .await
            .unwrap();

        let retention = chrono::Duration::minutes(60);
        assert!(registry.collect_expired(retention, Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::minutes(61);
        assert_eq!(registry.collect_expired(retention, later).await, vec![ended.clone()]);
        assert!(registry.lookup(&ended).await.is_err());
        assert!(registry.lookup(&live).await.is_ok());
        assert_eq!(registry.resolve(BackendKind::Assistant, "conv-1"), None);
        assert_eq!(registry.active_count().await, 1);
    }
}
