use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    secrecy::Secret,
    serde::Serialize,
    switchboard_common::{ClientIdentity, Cursor, Origin, SessionId},
};

use crate::error::Result;

// ── Assistant backend ───────────────────────────────────────────────────────

/// Short-lived credential minted by the assistant backend.
#[derive(Clone)]
pub struct Token(pub Secret<String>);

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

/// Handle to one assistant-side conversation.
#[derive(Clone, Serialize)]
pub struct ConversationRef {
    pub conversation_id: String,
    /// Conversation-scoped token used on every subsequent call.
    #[serde(skip_serializing)]
    pub token: Secret<String>,
}

impl ConversationRef {
    pub fn new(conversation_id: impl Into<String>, token: Secret<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            token,
        }
    }
}

impl std::fmt::Debug for ConversationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRef")
            .field("conversation_id", &self.conversation_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// One page of raw assistant records plus the cursor to resume from.
#[derive(Debug, Clone, Default)]
pub struct PollPage {
    pub records: Vec<serde_json::Value>,
    /// `None` means the backend did not advance; keep the current cursor.
    pub next_cursor: Option<Cursor>,
}

/// Automated conversational transport (token + conversation based).
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn issue_token(&self) -> Result<Token>;

    async fn start_conversation(&self, token: &Token) -> Result<ConversationRef>;

    async fn post_message(&self, conversation: &ConversationRef, text: &str) -> Result<()>;

    async fn poll(&self, conversation: &ConversationRef, cursor: Option<&Cursor>)
    -> Result<PollPage>;
}

// ── Agent backend ───────────────────────────────────────────────────────────

/// One prior exchange forwarded to the agent on handoff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub origin: Origin,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the agent backend needs to pick up a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPayload {
    pub session_id: SessionId,
    pub client: ClientIdentity,
    /// Assistant conversation this session is escalating from.
    pub assistant_conversation: Option<String>,
    /// Most recent entries, oldest first.
    pub transcript: Vec<TranscriptEntry>,
}

impl ContextPayload {
    /// Plain-text rendering of the transcript for backends that only take
    /// a single message body.
    pub fn summary(&self) -> String {
        let mut out = String::from("Previous conversation with the assistant:\n");
        for entry in &self.transcript {
            let who = match entry.origin {
                Origin::Client => "User",
                Origin::Assistant => "Assistant",
                Origin::Agent => "Agent",
                Origin::System => "System",
            };
            out.push_str(who);
            out.push_str(": ");
            out.push_str(&entry.text);
            out.push('\n');
        }
        out.push_str("\nUser is now being transferred to a live agent.");
        out
    }
}

/// Incremental poll filter for the agent backend.
#[derive(Debug, Clone, Default)]
pub struct PollFilter {
    /// Only records at or after this position.
    pub since: Option<Cursor>,
    pub limit: u32,
}

/// Human-operator conversational transport (session/topic based).
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Open a live-agent session. The response shape varies across
    /// backend versions, so it is returned raw for id extraction.
    async fn establish_session(&self, context: &ContextPayload) -> Result<serde_json::Value>;

    async fn post_message(&self, agent_session: &str, text: &str) -> Result<()>;

    async fn poll(&self, agent_session: &str, filter: &PollFilter)
    -> Result<Vec<serde_json::Value>>;
}
