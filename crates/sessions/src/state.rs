//! Session lifecycle state machine.
//!
//! ```text
//! Idle --StartAssistant--> AssistantActive --HandoffTriggered--> HandoffInProgress
//! HandoffInProgress --AgentEstablished--> AgentActive --AgentEndedChat--> Ended
//! HandoffInProgress --AgentEstablishFailed--> AssistantActive
//! (any non-terminal) --ClientDisconnect--> Ended
//! ```

use {
    serde::{Deserialize, Serialize},
    switchboard_channels::ConversationRef,
    switchboard_common::BackendKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AssistantActive,
    HandoffInProgress,
    AgentActive,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AssistantActive => "assistant_active",
            Self::HandoffInProgress => "handoff_in_progress",
            Self::AgentActive => "agent_active",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }

    /// Backend that receives client messages in this state.
    ///
    /// The assistant keeps routing while a handoff is being established.
    pub fn route(self) -> Option<BackendKind> {
        match self {
            Self::AssistantActive | Self::HandoffInProgress => Some(BackendKind::Assistant),
            Self::AgentActive => Some(BackendKind::Agent),
            Self::Idle | Self::Ended => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`next_state`]. Events carrying a reference attach it to the
/// session when the transition is accepted.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StartAssistant { conversation: ConversationRef },
    HandoffTriggered,
    AgentEstablished { agent_session: String },
    AgentEstablishFailed,
    AgentEndedChat,
    ClientDisconnect,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartAssistant { .. } => "start_assistant",
            Self::HandoffTriggered => "handoff_triggered",
            Self::AgentEstablished { .. } => "agent_established",
            Self::AgentEstablishFailed => "agent_establish_failed",
            Self::AgentEndedChat => "agent_ended_chat",
            Self::ClientDisconnect => "client_disconnect",
        }
    }
}

/// The state `event` leads to from `from`, or `None` when illegal.
pub fn next_state(from: SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionState::*;

    match (from, event) {
        (Idle, SessionEvent::StartAssistant { .. }) => Some(AssistantActive),
        (AssistantActive, SessionEvent::HandoffTriggered) => Some(HandoffInProgress),
        (HandoffInProgress, SessionEvent::AgentEstablished { .. }) => Some(AgentActive),
        (HandoffInProgress, SessionEvent::AgentEstablishFailed) => Some(AssistantActive),
        (AgentActive, SessionEvent::AgentEndedChat) => Some(Ended),
        (state, SessionEvent::ClientDisconnect) if !state.is_terminal() => Some(Ended),
        _ => None,
    }
}
