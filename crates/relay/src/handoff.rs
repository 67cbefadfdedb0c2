//! Escalation detection and the assistant-to-agent handoff protocol.
//!
//! One detector task per session watches the session feed. An assistant
//! message containing a trigger phrase moves the session to
//! `HandoffInProgress`; the detector then opens the agent session and
//! either commits (`AgentActive`, pollers swapped) or rolls back to
//! `AssistantActive` with a notice to the client.

use std::{sync::Arc, time::Duration};

use {
    futures::StreamExt,
    serde_json::Value,
    switchboard_channels::{
        AgentBackend, ContextPayload, PushChannel, TranscriptEntry, with_timeout,
    },
    switchboard_common::{BackendKind, NoticeLevel, Origin, SessionId},
    switchboard_config::{HandoffConfig, IdExtractionRule, MAX_ESTABLISH_RETRIES},
    switchboard_sessions::{Session, SessionEvent, SessionRegistry},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    fanin,
    ingest::Ingestor,
    poll::AgentPollSource,
    publisher::MessageStream,
    reconciler::Reconciler,
};

/// How the agent backend is polled once a handoff commits.
#[derive(Debug, Clone, Copy)]
pub struct AgentPolling {
    pub interval: Duration,
    pub limit: u32,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    Established { agent_session: String },
    /// Back in `AssistantActive`; the client was notified.
    RolledBack { reason: String },
    /// Another handoff already owns the session, or it ended meanwhile.
    Skipped,
}

/// Case-insensitive substring match against the configured phrases.
pub fn is_trigger(triggers: &[String], text: &str) -> bool {
    let text = text.to_lowercase();
    triggers
        .iter()
        .any(|t| !t.is_empty() && text.contains(t.as_str()))
}

/// Pull the agent session id out of an establish response. Rules run in
/// order and the first non-empty value wins; if none match, the assistant
/// conversation id is reused when `synthesize` is set.
pub fn extract_agent_session(
    rules: &[IdExtractionRule],
    response: &Value,
    assistant_ref: Option<&str>,
    synthesize: bool,
) -> Option<String> {
    rules
        .iter()
        .find_map(|rule| apply_rule(rule, response))
        .or_else(|| {
            assistant_ref
                .filter(|r| synthesize && !r.is_empty())
                .map(String::from)
        })
}

fn apply_rule(rule: &IdExtractionRule, response: &Value) -> Option<String> {
    let found = match rule {
        IdExtractionRule::Pointer { pointer } => response.pointer(pointer),
        IdExtractionRule::ArrayItem {
            array,
            match_field,
            match_value,
            field,
        } => response
            .pointer(array)?
            .as_array()?
            .iter()
            .find(|item| item.get(match_field).and_then(Value::as_str) == Some(match_value.as_str()))?
            .get(field),
    }?;
    match found {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `OutputText` items the agent backend returned with the new session.
pub fn initial_output(response: &Value) -> Vec<String> {
    response
        .get("body")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("uiType").and_then(Value::as_str) == Some("OutputText"))
                .filter_map(|item| item.get("value").and_then(Value::as_str))
                .filter(|text| !text.trim().is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub struct HandoffDetector {
    config: HandoffConfig,
    triggers: Vec<String>,
    registry: Arc<SessionRegistry>,
    ingestor: Arc<Ingestor>,
    reconciler: Arc<Reconciler>,
    agent: Arc<dyn AgentBackend>,
    push: Arc<dyn PushChannel>,
    polling: AgentPolling,
}

impl HandoffDetector {
    pub fn new(
        config: HandoffConfig,
        registry: Arc<SessionRegistry>,
        ingestor: Arc<Ingestor>,
        reconciler: Arc<Reconciler>,
        agent: Arc<dyn AgentBackend>,
        push: Arc<dyn PushChannel>,
        polling: AgentPolling,
    ) -> Self {
        let triggers = config.triggers.iter().map(|t| t.to_lowercase()).collect();
        Self {
            config,
            triggers,
            registry,
            ingestor,
            reconciler,
            agent,
            push,
            polling,
        }
    }

    /// Spawn the detector for one session. It runs until `token` is
    /// cancelled or the feed closes.
    pub fn watch(self: &Arc<Self>, session_id: SessionId, mut feed: MessageStream, token: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = token.cancelled() => break,
                    next = feed.next() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };
                if message.origin != Origin::Assistant || !is_trigger(&this.triggers, &message.text) {
                    continue;
                }
                debug!(session_id = %session_id, source_id = %message.source_id, "escalation trigger matched");
                match this.run(&session_id, &token).await {
                    Ok(outcome) => debug!(session_id = %session_id, ?outcome, "handoff finished"),
                    Err(e) => warn!(session_id = %session_id, error = %e, "handoff aborted"),
                }
            }
            debug!(session_id = %session_id, "handoff detector stopped");
        });
    }

    /// Run the handoff protocol for a session that just hit a trigger.
    pub async fn run(&self, session_id: &SessionId, token: &CancellationToken) -> Result<HandoffOutcome> {
        let session = match self
            .registry
            .transition(session_id, SessionEvent::HandoffTriggered)
            .await
        {
            Ok(session) => session,
            Err(e) if e.is_invalid_transition() => {
                debug!(session_id = %session_id, "handoff already underway or not applicable");
                return Ok(HandoffOutcome::Skipped);
            },
            Err(e) => return Err(e.into()),
        };
        self.ingestor
            .notice(session_id, NoticeLevel::Info, "Connecting you with a live agent...")
            .await;

        match self.establish(&session, token).await {
            Ok((agent_session, response)) => {
                self.commit(session_id, agent_session, &response, token)
                    .await
            },
            Err(e) => self.roll_back(session_id, e).await,
        }
    }

    async fn context(&self, session: &Session) -> ContextPayload {
        let transcript: Vec<TranscriptEntry> = match self.ingestor.store().query(&session.id).await {
            Ok(messages) => {
                let entries: Vec<TranscriptEntry> = messages
                    .into_iter()
                    .filter(|m| m.origin != Origin::System)
                    .map(|m| TranscriptEntry {
                        origin: m.origin,
                        timestamp: m.effective_ts(),
                        text: m.text,
                    })
                    .collect();
                let skip = entries.len().saturating_sub(self.config.transcript_limit);
                entries.into_iter().skip(skip).collect()
            },
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "transcript unavailable, handing off without it");
                Vec::new()
            },
        };
        ContextPayload {
            session_id: session.id.clone(),
            client: session.client.clone(),
            assistant_conversation: session.reference(BackendKind::Assistant).map(String::from),
            transcript,
        }
    }

    async fn establish(&self, session: &Session, token: &CancellationToken) -> Result<(String, Value)> {
        let context = self.context(session).await;
        let attempts = self.config.establish_retries.min(MAX_ESTABLISH_RETRIES) + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let call = with_timeout(
                "establish session",
                self.config.establish_timeout(),
                self.agent.establish_session(&context),
            );
            let result = tokio::select! {
                () = token.cancelled() => return Err(Error::handoff_failed("session ended during handoff")),
                result = call => result,
            };
            match result {
                Ok(response) => {
                    let agent_session = extract_agent_session(
                        &self.config.id_extraction,
                        &response,
                        session.reference(BackendKind::Assistant),
                        self.config.synthesize_from_assistant_ref,
                    )
                    .ok_or_else(|| Error::handoff_failed("no agent session id in establish response"))?;
                    return Ok((agent_session, response));
                },
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        attempt,
                        timed_out = e.is_timeout(),
                        error = %e,
                        "agent session establishment failed"
                    );
                    last_error = Some(e);
                },
            }
        }
        Err(match last_error {
            Some(e) => Error::handoff_failed(e),
            None => Error::handoff_failed("no establish attempts configured"),
        })
    }

    async fn commit(
        &self,
        session_id: &SessionId,
        agent_session: String,
        response: &Value,
        token: &CancellationToken,
    ) -> Result<HandoffOutcome> {
        match self
            .registry
            .transition(session_id, SessionEvent::AgentEstablished {
                agent_session: agent_session.clone(),
            })
            .await
        {
            Ok(_) => {},
            Err(e) if e.is_invalid_transition() => return Ok(HandoffOutcome::Skipped),
            Err(e) => return Err(e.into()),
        }

        // Early pushes carry upstream timestamps from before the commit, so
        // they go out before anything the pollers or the establish response
        // could publish.
        self.ingestor
            .claim_orphans(BackendKind::Agent, &agent_session, session_id)
            .await;

        if let Err(e) = fanin::attach(
            &self.push,
            &self.ingestor,
            BackendKind::Agent,
            session_id,
            &agent_session,
            token.child_token(),
        )
        .await
        {
            warn!(session_id = %session_id, error = %e, "agent push subscription failed, relying on polling");
        }
        self.reconciler.stop(session_id, BackendKind::Assistant);
        let source = AgentPollSource::new(
            Arc::clone(&self.agent),
            agent_session.clone(),
            self.polling.limit,
            self.polling.call_timeout,
        );
        self.reconciler
            .start(session_id, Arc::new(source), self.polling.interval, token);

        self.ingestor
            .notice(session_id, NoticeLevel::Success, "You're now connected with a live agent.")
            .await;
        // Establish output has no upstream timestamp; stamped locally, it
        // must not hold back agent messages sent before it.
        for text in initial_output(response) {
            self.ingestor
                .emit_local(session_id, Origin::Agent, text, None, None)
                .await;
        }

        info!(session_id = %session_id, agent_session = %agent_session, "handoff complete");
        Ok(HandoffOutcome::Established { agent_session })
    }

    async fn roll_back(&self, session_id: &SessionId, cause: Error) -> Result<HandoffOutcome> {
        match self
            .registry
            .transition(session_id, SessionEvent::AgentEstablishFailed)
            .await
        {
            Ok(_) => {},
            Err(e) if e.is_invalid_transition() => return Ok(HandoffOutcome::Skipped),
            Err(e) => return Err(e.into()),
        }
        warn!(session_id = %session_id, error = %cause, "handoff rolled back");
        self.ingestor
            .notice(
                session_id,
                NoticeLevel::Warning,
                "We couldn't reach a live agent right now. You're still chatting with the assistant.",
            )
            .await;
        Ok(HandoffOutcome::RolledBack {
            reason: cause.to_string(),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn triggers() -> Vec<String> {
        HandoffConfig::default()
            .triggers
            .iter()
            .map(|t| t.to_lowercase())
            .collect()
    }

    #[rstest]
    #[case("Let me connect you with an agent.", true)]
    #[case("I'm TRANSFERRING YOU TO AN AGENT now", true)]
    #[case("Would you like to speak to someone?", true)]
    #[case("How can I help you today?", false)]
    #[case("", false)]
    fn trigger_matching(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(is_trigger(&triggers(), text), expected);
    }

    #[test]
    fn empty_trigger_never_matches() {
        assert!(!is_trigger(&[String::new()], "anything"));
    }

    #[rstest]
    #[case::presence_action(
        json!({"body": [
            {"actionType": "StartConversation", "conversationId": "conv-9"},
            {"actionType": "SubscribeToChatPresence", "chatSessionId": "chat-1"}
        ]}),
        "chat-1"
    )]
    #[case::ui_data(json!({"body": {"uiData": {"chatSessionId": "chat-2"}}}), "chat-2")]
    #[case::top_level(json!({"chatSessionId": "chat-3"}), "chat-3")]
    #[case::start_conversation(
        json!({"body": [{"actionType": "StartConversation", "conversationId": "conv-4"}]}),
        "conv-4"
    )]
    #[case::numeric(json!({"chatSessionId": 42}), "42")]
    fn extraction_follows_rule_order(#[case] response: Value, #[case] expected: &str) {
        let rules = HandoffConfig::default().id_extraction;
        assert_eq!(
            extract_agent_session(&rules, &response, Some("assistant-conv"), true).as_deref(),
            Some(expected)
        );
    }

    #[test]
    fn blank_values_fall_through_to_next_rule() {
        let rules = HandoffConfig::default().id_extraction;
        let response = json!({"chatSessionId": "  ", "body": [{"actionType": "StartConversation", "conversationId": "c"}]});
        assert_eq!(
            extract_agent_session(&rules, &response, None, false).as_deref(),
            Some("c")
        );
    }

    #[test]
    fn synthesis_uses_assistant_reference() {
        let rules = HandoffConfig::default().id_extraction;
        let response = json!({"status": "ok"});
        assert_eq!(
            extract_agent_session(&rules, &response, Some("dl-conv"), true).as_deref(),
            Some("dl-conv")
        );
        assert_eq!(extract_agent_session(&rules, &response, Some("dl-conv"), false), None);
        assert_eq!(extract_agent_session(&rules, &response, None, true), None);
    }

    #[test]
    fn initial_output_collects_output_text() {
        let response = json!({"body": [
            {"uiType": "OutputText", "value": "Hi, this is Dana."},
            {"uiType": "ActionMsg", "value": "ignored"},
            {"uiType": "OutputText", "value": "  "},
            {"uiType": "OutputText", "value": "How can I help?"}
        ]});
        assert_eq!(initial_output(&response), vec!["Hi, this is Dana.", "How can I help?"]);
        assert!(initial_output(&json!({"body": {}})).is_empty());
    }
}
