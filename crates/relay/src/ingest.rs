//! The single path every inbound message takes, whichever way it arrived:
//! normalize, resolve, store, dedup, publish.

use std::{sync::Arc, time::Duration};

use {
    chrono::Utc,
    serde_json::Value,
    switchboard_channels::MessageStore,
    switchboard_common::{BackendKind, CanonicalMessage, NoticeLevel, Origin, SessionId},
    switchboard_sessions::{DedupCache, SessionRegistry},
    tokio::sync::mpsc,
    tracing::{debug, warn},
    uuid::Uuid,
};

use crate::{
    error::{Error, Result},
    normalize::{Normalized, NormalizedMessage, Normalizer, SkipReason},
    orphan::OrphanBuffer,
    publisher::{PublishOutcome, Publisher},
};

/// Lifecycle signals raised by inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    AgentEndedChat(SessionId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stored and handed to the publisher.
    Delivered(CanonicalMessage),
    /// Stored, but older than what subscribers already saw.
    Stale,
    /// Source id already surfaced for this session.
    Duplicate,
    Skipped(SkipReason),
    /// Held until its session reference appears.
    Orphaned,
    /// Session unknown with nothing to wait on, or already ended.
    Dropped,
}

pub struct Ingestor {
    registry: Arc<SessionRegistry>,
    dedup: Arc<DedupCache>,
    store: Arc<dyn MessageStore>,
    publisher: Arc<Publisher>,
    orphans: OrphanBuffer,
    normalizer: Normalizer,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl Ingestor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn MessageStore>,
        publisher: Arc<Publisher>,
        normalizer: Normalizer,
        orphan_capacity: usize,
        orphan_ttl: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let ingestor = Self {
            registry,
            dedup: Arc::new(DedupCache::new()),
            store,
            publisher,
            orphans: OrphanBuffer::new(orphan_capacity, orphan_ttl),
            normalizer,
            control,
        };
        (ingestor, control_rx)
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Ingest one raw payload. `session` is set by the poll path, which
    /// already knows its session; push payloads are resolved by reference.
    pub async fn ingest(
        &self,
        backend: BackendKind,
        raw: &Value,
        session: Option<&SessionId>,
    ) -> Result<IngestOutcome> {
        let normalized = match self.normalizer.normalize(backend, raw) {
            Normalized::Message(m) => m,
            Normalized::Skip(reason) => {
                debug!(backend = %backend, ?reason, "skipping inbound payload");
                return Ok(IngestOutcome::Skipped(reason));
            },
        };

        let session_id = match session {
            Some(id) => id.clone(),
            None => {
                let resolved = normalized
                    .session_hint
                    .as_deref()
                    .and_then(|hint| self.registry.resolve(backend, hint));
                match (resolved, normalized.session_hint.clone()) {
                    (Some(id), _) => id,
                    (None, Some(reference)) => {
                        debug!(backend = %backend, reference = %reference, "holding orphaned payload");
                        return Ok(if self.orphans.hold(backend, reference, raw.clone()) {
                            IngestOutcome::Orphaned
                        } else {
                            IngestOutcome::Dropped
                        });
                    },
                    (None, None) => {
                        warn!(backend = %backend, "UnknownSession: payload carries no session reference");
                        return Ok(IngestOutcome::Dropped);
                    },
                }
            },
        };

        self.deliver(normalized, &session_id).await
    }

    async fn deliver(&self, normalized: NormalizedMessage, session_id: &SessionId) -> Result<IngestOutcome> {
        match self.registry.state(session_id).await {
            Ok(state) if state.is_terminal() => {
                debug!(session_id = %session_id, "discarding message for ended session");
                return Ok(IngestOutcome::Dropped);
            },
            Ok(_) => {},
            Err(switchboard_sessions::Error::NotFound { .. }) => return Ok(IngestOutcome::Dropped),
            Err(e) => return Err(e.into()),
        }

        let backend = normalized.backend;
        let chat_ended = normalized.chat_ended;
        let dedup_key = format!("{backend}:{}", normalized.identity());
        let message = normalized.into_canonical(session_id.clone(), Utc::now());

        self.store
            .upsert(session_id, &message.id, &message)
            .await
            .map_err(Error::Store)?;

        if !self.dedup.mark_seen(session_id, &dedup_key) {
            debug!(session_id = %session_id, source_id = %message.source_id, "duplicate message absorbed");
            return Ok(IngestOutcome::Duplicate);
        }
        // Best effort: the session may be swept concurrently.
        let _ = self.registry.touch(session_id).await;

        let outcome = match self.publisher.publish(message.clone()) {
            PublishOutcome::Emitted | PublishOutcome::NoFeed => IngestOutcome::Delivered(message),
            PublishOutcome::Stale => IngestOutcome::Stale,
        };
        if chat_ended {
            let _ = self
                .control
                .send(ControlEvent::AgentEndedChat(session_id.clone()));
        }
        Ok(outcome)
    }

    /// Retry payloads that were waiting on `reference`, now owned by
    /// `session_id`. Each orphan gets this one retry.
    pub async fn claim_orphans(
        &self,
        backend: BackendKind,
        reference: &str,
        session_id: &SessionId,
    ) -> usize {
        let mut delivered = 0;
        for raw in self.orphans.claim(backend, reference) {
            match self.ingest(backend, &raw, Some(session_id)).await {
                Ok(IngestOutcome::Delivered(_)) => delivered += 1,
                Ok(_) => {},
                Err(e) => {
                    warn!(
                        backend = %backend,
                        reference,
                        error = %e,
                        "UnknownSession: orphan retry failed, dropping payload"
                    );
                },
            }
        }
        delivered
    }

    pub fn expire_orphans(&self) -> usize {
        self.orphans.expire()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Publish and store a message generated inside the relay (client
    /// input, system notices). Returns `None` if the session feed is closed.
    pub async fn emit_local(
        &self,
        session_id: &SessionId,
        origin: Origin,
        text: impl Into<String>,
        notice: Option<NoticeLevel>,
        sender_name: Option<String>,
    ) -> Option<CanonicalMessage> {
        let text = text.into();
        let source_id = format!("local:{}", Uuid::new_v4());
        let message = self.publisher.publish_local(session_id, |ts| CanonicalMessage {
            id: CanonicalMessage::derive_id(session_id, "local", &source_id),
            session_id: session_id.clone(),
            origin,
            text,
            attachments: Vec::new(),
            upstream_ts: None,
            received_at: ts,
            source_id: source_id.clone(),
            sequence: None,
            sender_name,
            notice,
        })?;
        if let Err(e) = self.store.upsert(session_id, &message.id, &message).await {
            warn!(session_id = %session_id, error = %e, "failed to store local message");
        }
        Some(message)
    }

    /// Post a system notice to the session's subscribers.
    pub async fn notice(
        &self,
        session_id: &SessionId,
        level: NoticeLevel,
        text: impl Into<String>,
    ) -> Option<CanonicalMessage> {
        self.emit_local(session_id, Origin::System, text, Some(level), None)
            .await
    }

    pub fn forget(&self, session_id: &SessionId) {
        self.dedup.clear(session_id);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        secrecy::Secret,
        serde_json::json,
        switchboard_channels::{ConversationRef, InMemoryMessageStore},
        switchboard_common::ClientIdentity,
        switchboard_sessions::SessionEvent,
    };

    struct Fixture {
        registry: Arc<SessionRegistry>,
        publisher: Arc<Publisher>,
        store: Arc<InMemoryMessageStore>,
        ingestor: Ingestor,
        control: mpsc::UnboundedReceiver<ControlEvent>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let publisher = Arc::new(Publisher::new(16));
        let store = Arc::new(InMemoryMessageStore::new());
        let (ingestor, control) = Ingestor::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::clone(&publisher),
            Normalizer::new("user"),
            8,
            Duration::from_secs(30),
        );
        Fixture {
            registry,
            publisher,
            store,
            ingestor,
            control,
        }
    }

    async fn agent_session(f: &Fixture, agent_ref: &str) -> SessionId {
        let id = f.registry.create_session(ClientIdentity::new("u1")).id;
        f.registry
            .transition(&id, SessionEvent::StartAssistant {
                conversation: ConversationRef::new("conv-1", Secret::new("t".into())),
            })
            .await
            .unwrap();
        f.registry
            .transition(&id, SessionEvent::HandoffTriggered)
            .await
            .unwrap();
        f.registry
            .transition(&id, SessionEvent::AgentEstablished {
                agent_session: agent_ref.into(),
            })
            .await
            .unwrap();
        f.publisher.open(&id);
        id
    }

    #[tokio::test]
    async fn push_and_poll_copies_deliver_once() {
        let f = fixture();
        let id = agent_session(&f, "abc123").await;
        // Webhook shape: no sys_id, author in created_by.
        let pushed = json!({
            "created_on": "2025-10-23 12:05:10",
            "created_by": "live1",
            "conversation_id": "abc123",
            "payload": "{\"type\":\"Text\",\"message\":\"Hi from Sam\"}"
        });
        // Table row shape for the same message.
        let polled = json!({
            "sys_id": "m1",
            "send_time": "2025-10-23 12:05:10",
            "sys_created_by": "live1",
            "payload": "{\"type\":\"Text\",\"message\":\"Hi from Sam\"}"
        });

        let first = f.ingestor.ingest(BackendKind::Agent, &pushed, None).await.unwrap();
        let second = f
            .ingestor
            .ingest(BackendKind::Agent, &polled, Some(&id))
            .await
            .unwrap();

        assert!(matches!(first, IngestOutcome::Delivered(_)));
        assert_eq!(second, IngestOutcome::Duplicate);
        let stored = f.store.query(&id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "Hi from Sam");
    }

    #[tokio::test]
    async fn unknown_reference_is_orphaned_then_claimed() {
        let f = fixture();
        let early = json!({"sys_id": "m0", "conversation_id": "abc123", "payload": "early bird"});
        assert_eq!(
            f.ingestor.ingest(BackendKind::Agent, &early, None).await.unwrap(),
            IngestOutcome::Orphaned
        );
        assert_eq!(f.ingestor.orphan_count(), 1);

        let id = agent_session(&f, "abc123").await;
        assert_eq!(f.ingestor.claim_orphans(BackendKind::Agent, "abc123", &id).await, 1);
        assert_eq!(f.ingestor.orphan_count(), 0);
        assert_eq!(f.store.query(&id).await.unwrap()[0].text, "early bird");
    }

    #[tokio::test]
    async fn payload_without_reference_is_dropped() {
        let f = fixture();
        let raw = json!({"sys_id": "m0", "payload": "who am I"});
        assert_eq!(
            f.ingestor.ingest(BackendKind::Agent, &raw, None).await.unwrap(),
            IngestOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn chat_ended_raises_control_event() {
        let mut f = fixture();
        let id = agent_session(&f, "abc123").await;
        let raw = json!({
            "conversation_id": "abc123",
            "payload": "{\"type\":\"System\",\"eventType\":\"ChatEnded\"}"
        });
        let outcome = f.ingestor.ingest(BackendKind::Agent, &raw, None).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Delivered(ref m) if m.origin == Origin::System));
        assert_eq!(
            f.control.recv().await.unwrap(),
            ControlEvent::AgentEndedChat(id)
        );
    }

    #[tokio::test]
    async fn ended_sessions_discard_results() {
        let f = fixture();
        let id = agent_session(&f, "abc123").await;
        f.registry
            .transition(&id, SessionEvent::ClientDisconnect)
            .await
            .unwrap();
        let raw = json!({"sys_id": "late", "payload": "too late"});
        assert_eq!(
            f.ingestor.ingest(BackendKind::Agent, &raw, Some(&id)).await.unwrap(),
            IngestOutcome::Dropped
        );
        assert!(f.store.query(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_messages_are_stored_not_emitted() {
        let f = fixture();
        let id = agent_session(&f, "abc123").await;
        let newer = json!({"sys_id": "b", "payload": "second", "send_time": "2025-10-23 12:05:00"});
        let older = json!({"sys_id": "a", "payload": "first", "send_time": "2025-10-23 12:00:00"});
        f.ingestor.ingest(BackendKind::Agent, &newer, Some(&id)).await.unwrap();
        assert_eq!(
            f.ingestor.ingest(BackendKind::Agent, &older, Some(&id)).await.unwrap(),
            IngestOutcome::Stale
        );
        let texts: Vec<String> = f.store.query(&id).await.unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn notices_are_stored_with_level() {
        let f = fixture();
        let id = agent_session(&f, "abc123").await;
        let notice = f
            .ingestor
            .notice(&id, NoticeLevel::Warning, "connection degraded")
            .await
            .unwrap();
        assert_eq!(notice.origin, Origin::System);
        assert_eq!(notice.notice, Some(NoticeLevel::Warning));
        assert_eq!(f.store.query(&id).await.unwrap().len(), 1);
    }
}
