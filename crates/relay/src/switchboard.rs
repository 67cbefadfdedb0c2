//! The relay façade: the only entry point the gateway and the binary use.

use std::sync::{Arc, Weak};

use {
    chrono::Utc,
    dashmap::DashMap,
    serde::Serialize,
    serde_json::Value,
    switchboard_channels::{
        AgentBackend, AssistantBackend, MessageStore, PushChannel, with_timeout,
    },
    switchboard_common::{BackendKind, CanonicalMessage, ClientIdentity, Origin, SessionId},
    switchboard_config::{RelayConfig, SwitchboardConfig},
    switchboard_sessions::{Session, SessionEvent, SessionRegistry, SessionState},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    fanin,
    handoff::{AgentPolling, HandoffDetector},
    ingest::{ControlEvent, IngestOutcome, Ingestor},
    normalize::Normalizer,
    poll::AssistantPollSource,
    publisher::{MessageStream, Publisher},
    reconciler::{BackoffPolicy, Reconciler},
};

/// The four collaborators the relay talks to.
pub struct Collaborators {
    pub assistant: Arc<dyn AssistantBackend>,
    pub agent: Arc<dyn AgentBackend>,
    pub push: Arc<dyn PushChannel>,
    pub store: Arc<dyn MessageStore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub sessions: usize,
    pub active_sessions: usize,
    pub orphaned_payloads: usize,
}

pub struct Switchboard {
    relay: RelayConfig,
    registry: Arc<SessionRegistry>,
    publisher: Arc<Publisher>,
    ingestor: Arc<Ingestor>,
    reconciler: Arc<Reconciler>,
    detector: Arc<HandoffDetector>,
    assistant: Arc<dyn AssistantBackend>,
    push: Arc<dyn PushChannel>,
    agent: Arc<dyn AgentBackend>,
    /// Parent token per live session; cancelling it stops every task the
    /// session owns.
    tokens: DashMap<SessionId, CancellationToken>,
    shutdown: CancellationToken,
}

impl Switchboard {
    /// Wire up the relay. Must be called inside a Tokio runtime: the
    /// lifecycle control loop is spawned here.
    pub fn new(config: &SwitchboardConfig, collaborators: Collaborators) -> Arc<Self> {
        let relay = config.relay.clone();
        let registry = Arc::new(SessionRegistry::new());
        let publisher = Arc::new(Publisher::new(relay.subscriber_buffer));
        let (ingestor, control) = Ingestor::new(
            Arc::clone(&registry),
            Arc::clone(&collaborators.store),
            Arc::clone(&publisher),
            Normalizer::new(config.assistant.user_id.clone()),
            relay.orphan_capacity,
            relay.orphan_ttl(),
        );
        let ingestor = Arc::new(ingestor);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&ingestor),
            Arc::clone(&registry),
            BackoffPolicy {
                base: relay.backoff_base(),
                max: relay.backoff_max(),
            },
            relay.degraded_after_failures,
        ));
        let detector = Arc::new(HandoffDetector::new(
            config.handoff.clone(),
            Arc::clone(&registry),
            Arc::clone(&ingestor),
            Arc::clone(&reconciler),
            Arc::clone(&collaborators.agent),
            Arc::clone(&collaborators.push),
            AgentPolling {
                interval: relay.agent_poll_interval(),
                limit: config.agent.poll_limit,
                call_timeout: relay.call_timeout(),
            },
        ));

        let switchboard = Arc::new(Self {
            relay,
            registry,
            publisher,
            ingestor,
            reconciler,
            detector,
            assistant: collaborators.assistant,
            push: collaborators.push,
            agent: collaborators.agent,
            tokens: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(control_loop(
            Arc::downgrade(&switchboard),
            control,
            switchboard.shutdown.clone(),
        ));
        switchboard
    }

    /// Open a session and its assistant conversation. On any failure the
    /// half-built session is ended before the error is returned.
    pub async fn create_session(&self, client: ClientIdentity) -> Result<Session> {
        let id = self.registry.create_session(client).id;
        match self.start_assistant(&id).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(session_id = %id, error = %e, "session start failed");
                let _ = self
                    .registry
                    .transition(&id, SessionEvent::ClientDisconnect)
                    .await;
                self.teardown(&id);
                Err(e)
            },
        }
    }

    async fn start_assistant(&self, id: &SessionId) -> Result<Session> {
        let timeout = self.relay.call_timeout();
        let token = with_timeout("issue token", timeout, self.assistant.issue_token())
            .await
            .map_err(|e| Error::backend("assistant", e))?;
        let conversation = with_timeout(
            "start conversation",
            timeout,
            self.assistant.start_conversation(&token),
        )
        .await
        .map_err(|e| Error::backend("assistant", e))?;
        let conversation_id = conversation.conversation_id.clone();

        let session = self
            .registry
            .transition(id, SessionEvent::StartAssistant {
                conversation: conversation.clone(),
            })
            .await?;

        self.publisher.open(id);
        self.ingestor.dedup().open(id);
        let cancel = self.shutdown.child_token();
        self.tokens.insert(id.clone(), cancel.clone());

        if let Some(feed) = self.publisher.subscribe(id) {
            self.detector.watch(id.clone(), feed, cancel.clone());
        }
        let source = AssistantPollSource::new(Arc::clone(&self.assistant), conversation, timeout);
        self.reconciler.start(
            id,
            Arc::new(source),
            self.relay.assistant_poll_interval(),
            &cancel,
        );
        if let Err(e) = fanin::attach(
            &self.push,
            &self.ingestor,
            BackendKind::Assistant,
            id,
            &conversation_id,
            cancel.child_token(),
        )
        .await
        {
            warn!(session_id = %id, error = %e, "assistant push subscription failed, relying on polling");
        }
        self.ingestor
            .claim_orphans(BackendKind::Assistant, &conversation_id, id)
            .await;

        info!(session_id = %id, conversation_id = %conversation_id, "session started");
        Ok(session)
    }

    /// Route client text to whichever backend currently owns the session,
    /// then echo it to subscribers.
    pub async fn send_client_message(&self, id: &SessionId, text: &str) -> Result<CanonicalMessage> {
        let session = self.registry.lookup(id).await?;
        let not_routable = || Error::NotRoutable {
            session_id: id.clone(),
            state: session.state,
        };
        let timeout = self.relay.call_timeout();

        match session.active_route() {
            Some(BackendKind::Assistant) => {
                let conversation = session.assistant_ref.as_ref().ok_or_else(not_routable)?;
                with_timeout(
                    "assistant post",
                    timeout,
                    self.assistant.post_message(conversation, text),
                )
                .await
                .map_err(|e| Error::backend("assistant", e))?;
            },
            Some(BackendKind::Agent) => {
                let agent_session = session.agent_ref.as_deref().ok_or_else(not_routable)?;
                with_timeout(
                    "agent post",
                    timeout,
                    self.agent.post_message(agent_session, text),
                )
                .await
                .map_err(|e| Error::backend("agent", e))?;
            },
            None => return Err(not_routable()),
        }

        let sender = session
            .client
            .display_name
            .clone()
            .unwrap_or_else(|| session.client.id.clone());
        self.ingestor
            .emit_local(id, Origin::Client, text, None, Some(sender))
            .await
            .ok_or_else(|| Error::NotRoutable {
                session_id: id.clone(),
                state: SessionState::Ended,
            })
    }

    /// Live feed for a session.
    pub async fn subscribe(&self, id: &SessionId) -> Result<MessageStream> {
        let state = self.registry.state(id).await?;
        self.publisher
            .subscribe(id)
            .ok_or(Error::NotRoutable {
                session_id: id.clone(),
                state,
            })
    }

    /// End a session from the client side. Ending twice is not an error.
    pub async fn end_session(&self, id: &SessionId) -> Result<Session> {
        let session = self.registry.lookup(id).await?;
        if session.state.is_terminal() {
            return Ok(session);
        }
        let session = self
            .registry
            .transition(id, SessionEvent::ClientDisconnect)
            .await?;
        self.teardown(id);
        Ok(session)
    }

    /// Push callback path: resolve by the reference the payload carries.
    pub async fn ingest_push(&self, backend: BackendKind, raw: &Value) -> Result<IngestOutcome> {
        self.ingestor.ingest(backend, raw, None).await
    }

    /// Stored transcript, oldest first.
    pub async fn history(&self, id: &SessionId) -> Result<Vec<CanonicalMessage>> {
        let messages = self.ingestor.store().query(id).await.map_err(Error::Store)?;
        if messages.is_empty() {
            self.registry.lookup(id).await?;
        }
        Ok(messages)
    }

    pub async fn session(&self, id: &SessionId) -> Result<Session> {
        Ok(self.registry.lookup(id).await?)
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.registry.len(),
            active_sessions: self.registry.active_count().await,
            orphaned_payloads: self.ingestor.orphan_count(),
        }
    }

    /// Forget sessions that ended longer ago than the retention window and
    /// expire stale orphans. Returns the number of sessions removed.
    pub async fn sweep(&self) -> usize {
        let retention = chrono::Duration::from_std(self.relay.session_retention())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expired = self.registry.collect_expired(retention, Utc::now()).await;
        for id in &expired {
            self.teardown(id);
            self.reconciler.forget(id);
            self.ingestor.forget(id);
        }
        let orphans = self.ingestor.expire_orphans();
        if !expired.is_empty() || orphans > 0 {
            info!(sessions = expired.len(), orphans, "sweep complete");
        }
        expired.len()
    }

    /// Run [`Switchboard::sweep`] every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.relay.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let Some(this) = weak.upgrade() else { break };
                this.sweep().await;
            }
            debug!("sweeper stopped");
        });
    }

    /// Cancel every session task and close every feed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<SessionId> = self.tokens.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.teardown(id);
        }
        info!(sessions = ids.len(), "switchboard shut down");
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn teardown(&self, id: &SessionId) {
        if let Some((_, token)) = self.tokens.remove(id) {
            token.cancel();
        }
        self.reconciler.stop(id, BackendKind::Assistant);
        self.reconciler.stop(id, BackendKind::Agent);
        self.publisher.close(id);
    }

    async fn on_agent_ended(&self, id: &SessionId) {
        match self
            .registry
            .transition(id, SessionEvent::AgentEndedChat)
            .await
        {
            Ok(_) => self.teardown(id),
            Err(e) => warn!(session_id = %id, error = %e, "ignoring chat-ended signal"),
        }
    }
}

async fn control_loop(
    switchboard: Weak<Switchboard>,
    mut control: mpsc::UnboundedReceiver<ControlEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = control.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(this) = switchboard.upgrade() else { break };
        match event {
            ControlEvent::AgentEndedChat(id) => this.on_agent_ended(&id).await,
        }
    }
    debug!("control loop stopped");
}
